//! Reconnect backoff under the knobs a worker can be started with.
//! The long sweep is ignored by default:
//! cargo test --test stress_reconnect -- --ignored

use std::time::Duration;

use clap::Parser;

use clipboard_relay::config::WorkerConfig;
use clipboard_relay::worker_agent::reconnect_delay;

const JITTER: Duration = Duration::from_millis(250);

fn knobs(base_ms: u64, max_ms: u64) -> (Duration, Duration) {
    let cfg = WorkerConfig::parse_from([
        "worker".to_string(),
        "--reconnect-base-ms".to_string(),
        base_ms.to_string(),
        "--reconnect-max-ms".to_string(),
        max_ms.to_string(),
    ]);
    (
        Duration::from_millis(cfg.reconnect_base_ms),
        Duration::from_millis(cfg.reconnect_max_ms),
    )
}

/// `base * 2^attempt` capped, without jitter.
fn floor(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.checked_mul(2u32.saturating_pow(attempt.min(31)))
        .unwrap_or(cap)
        .min(cap)
}

#[test]
fn configured_base_and_cap_bound_every_delay() {
    for (base_ms, max_ms) in [(250, 4_000), (1_000, 30_000), (40, 45), (5, 5)] {
        let (base, cap) = knobs(base_ms, max_ms);
        for attempt in 0..12 {
            let delay = reconnect_delay(attempt, base, cap);
            let low = floor(attempt, base, cap);
            assert!(
                delay >= low && delay <= low + JITTER,
                "base {base_ms}ms cap {max_ms}ms attempt {attempt}: {delay:?} outside {low:?}+jitter"
            );
        }
    }
}

#[test]
fn small_cap_is_reached_within_a_few_attempts() {
    let (base, cap) = knobs(250, 4_000);
    // 250, 500, 1000, 2000, 4000
    let delay = reconnect_delay(4, base, cap);
    assert!(delay >= cap);
    assert!(delay <= cap + JITTER);
}

#[test]
#[ignore]
fn jitter_spreads_over_many_samples_at_the_cap() {
    let (base, cap) = knobs(1_000, 30_000);
    let samples: Vec<Duration> = (0..2_000)
        .map(|_| reconnect_delay(50, base, cap))
        .collect();
    let min = samples.iter().min().copied().unwrap_or_default();
    let max = samples.iter().max().copied().unwrap_or_default();
    assert!(min >= cap);
    assert!(max <= cap + JITTER);
    // 2000 draws from 251 values land on more than one.
    assert!(max > min, "jitter never varied: {min:?}");
}
