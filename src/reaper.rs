use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broker::Broker;

/// Periodically close connections that have gone quiet for longer than
/// `idle_timeout`.
pub fn spawn_reaper(broker: Broker, period: Duration, idle_timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        tick.tick().await;
        loop {
            tick.tick().await;
            let evicted = broker.evict_idle(idle_timeout, Instant::now());
            if !evicted.is_empty() {
                tracing::info!(
                    target = "clipboard_relay::reaper",
                    evicted = evicted.len(),
                    clients = broker.clients().len(),
                    workers = broker.workers().len(),
                    "reaped idle connections"
                );
            }
        }
    })
}
