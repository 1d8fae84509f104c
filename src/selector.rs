//! Worker selection policies.

use clap::ValueEnum;

use crate::registry::{ConnectionId, ConnectionRecord, ConnectionState, Role};

/// Picks one worker for a request. `candidates` is a registry snapshot in
/// registration order; implementations must apply [`is_eligible`] themselves
/// so snapshots may be passed through unfiltered.
pub trait WorkerSelector: Send + Sync {
    fn select(&self, candidates: &[ConnectionRecord], model_hint: Option<&str>)
        -> Option<ConnectionId>;
}

/// Registered, still open, and not shutting down.
pub fn is_eligible(record: &ConnectionRecord) -> bool {
    record.role == Role::Worker
        && record.state == ConnectionState::Active
        && record.capabilities.is_some()
        && !record.draining
        && record.is_open()
}

fn advertises(record: &ConnectionRecord, model: &str) -> bool {
    record
        .capabilities
        .as_ref()
        .is_some_and(|caps| caps.serves(model))
}

/// Split eligible workers into those advertising the hint and the rest,
/// keeping registration order within each group.
fn partition<'a>(
    candidates: &'a [ConnectionRecord],
    model_hint: Option<&str>,
) -> (Vec<&'a ConnectionRecord>, Vec<&'a ConnectionRecord>) {
    let mut eligible: Vec<&ConnectionRecord> =
        candidates.iter().filter(|r| is_eligible(r)).collect();
    eligible.sort_by_key(|record| record.seq);
    match model_hint {
        Some(model) => eligible.into_iter().partition(|r| advertises(r, model)),
        None => (Vec::new(), eligible),
    }
}

/// First eligible worker by registration order, preferring one that
/// advertises the requested model.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl WorkerSelector for FirstAvailable {
    fn select(
        &self,
        candidates: &[ConnectionRecord],
        model_hint: Option<&str>,
    ) -> Option<ConnectionId> {
        let (preferred, rest) = partition(candidates, model_hint);
        preferred.first().or_else(|| rest.first()).map(|r| r.id)
    }
}

/// Fewest in-flight dispatches wins, ties broken by registration order.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl WorkerSelector for LeastLoaded {
    fn select(
        &self,
        candidates: &[ConnectionRecord],
        model_hint: Option<&str>,
    ) -> Option<ConnectionId> {
        let pick = |group: &[&ConnectionRecord]| {
            group
                .iter()
                .min_by_key(|record| (record.in_flight, record.seq))
                .map(|record| record.id)
        };
        let (preferred, rest) = partition(candidates, model_hint);
        pick(&preferred).or_else(|| pick(&rest))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SelectionPolicy {
    #[default]
    FirstAvailable,
    LeastLoaded,
}

impl SelectionPolicy {
    pub fn build(self) -> Box<dyn WorkerSelector> {
        match self {
            SelectionPolicy::FirstAvailable => Box::new(FirstAvailable),
            SelectionPolicy::LeastLoaded => Box::new(LeastLoaded),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::{Capabilities, ConnectionRegistry, Outbound, OutboundHandle};

    struct Pool {
        registry: ConnectionRegistry,
        receivers: Vec<mpsc::UnboundedReceiver<Outbound>>,
    }

    impl Pool {
        fn new() -> Self {
            Self {
                registry: ConnectionRegistry::new(Role::Worker),
                receivers: Vec::new(),
            }
        }

        fn add(&mut self, models: &[&str]) -> ConnectionId {
            let (outbound, rx) = OutboundHandle::channel();
            let id = self.registry.register(outbound, None);
            self.registry.set_capabilities(
                &id,
                Capabilities {
                    worker_id: format!("w{}", self.receivers.len()),
                    models: models.iter().map(|m| m.to_string()).collect(),
                    default_model: None,
                },
            );
            self.registry.set_state(&id, ConnectionState::Active);
            self.receivers.push(rx);
            id
        }

        fn close(&mut self, index: usize) {
            self.receivers[index].close();
        }
    }

    #[test]
    fn first_available_picks_earliest_without_hint() {
        let mut pool = Pool::new();
        let w1 = pool.add(&["qwen-coder"]);
        let _w2 = pool.add(&["qwen-coder"]);
        assert_eq!(FirstAvailable.select(&pool.registry.list(), None), Some(w1));
    }

    #[test]
    fn first_available_moves_on_when_earliest_closes() {
        let mut pool = Pool::new();
        let _w1 = pool.add(&["qwen-coder"]);
        let w2 = pool.add(&["qwen-coder"]);
        pool.close(0);
        assert_eq!(FirstAvailable.select(&pool.registry.list(), None), Some(w2));
    }

    #[test]
    fn model_hint_is_preferred_then_falls_back() {
        let mut pool = Pool::new();
        let w1 = pool.add(&["codellama"]);
        let w2 = pool.add(&["qwen-coder"]);
        let snapshot = pool.registry.list();
        assert_eq!(FirstAvailable.select(&snapshot, Some("qwen-coder")), Some(w2));
        assert_eq!(FirstAvailable.select(&snapshot, Some("mistral")), Some(w1));
    }

    #[test]
    fn unregistered_and_draining_workers_are_skipped() {
        let mut pool = Pool::new();
        let (outbound, _rx) = OutboundHandle::channel();
        let _unregistered = pool.registry.register(outbound, None);
        let draining = pool.add(&["qwen-coder"]);
        pool.registry.mark_draining(&draining);
        assert_eq!(FirstAvailable.select(&pool.registry.list(), None), None);

        let ready = pool.add(&[]);
        assert_eq!(FirstAvailable.select(&pool.registry.list(), None), Some(ready));
    }

    #[test]
    fn empty_pool_is_not_available() {
        let pool = Pool::new();
        assert_eq!(FirstAvailable.select(&pool.registry.list(), Some("qwen-coder")), None);
        assert_eq!(LeastLoaded.select(&pool.registry.list(), None), None);
    }

    #[test]
    fn least_loaded_prefers_idle_worker() {
        let mut pool = Pool::new();
        let w1 = pool.add(&["qwen-coder"]);
        let w2 = pool.add(&["qwen-coder"]);
        pool.registry.adjust_in_flight(&w1, 2);
        assert_eq!(LeastLoaded.select(&pool.registry.list(), None), Some(w2));
        pool.registry.adjust_in_flight(&w2, 2);
        assert_eq!(LeastLoaded.select(&pool.registry.list(), None), Some(w1));
    }
}
