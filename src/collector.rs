//! Fan-in buffers.
//!
//! A fan-in step calls [`Context::collect_events`](crate::Context::collect_events)
//! once per arriving event. The buffer for that step keeps the arrivals
//! until the expected count is reached, then hands the whole set back
//! exactly once, in arrival order, and resets.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use crate::event::{AnyEvent, EventKind};
use crate::{HeddleError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CollectionKey {
    step: String,
    kinds: Vec<EventKind>,
}

#[derive(Debug)]
struct Collection {
    expected: usize,
    arrived: Vec<AnyEvent>,
}

/// Run-scoped buffers for every fan-in point.
#[derive(Debug, Default)]
pub(crate) struct EventCollector {
    buffers: Mutex<HashMap<CollectionKey, Collection>>,
}

impl EventCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `event` for `step` and releases the set once `expected`
    /// events of `kinds` have arrived.
    ///
    /// `expected` is read on every call so a step may pass a value it
    /// only learned mid-run (e.g. from state); the latest value wins.
    pub(crate) async fn collect(
        &self,
        step: &str,
        event: AnyEvent,
        kinds: &[EventKind],
        expected: usize,
    ) -> Result<Option<Vec<AnyEvent>>> {
        if expected == 0 {
            return Err(HeddleError::InvalidWorkflow(format!(
                "step {step} collects zero events"
            )));
        }
        if !kinds.contains(&event.kind()) {
            return Err(HeddleError::UnexpectedEvent {
                step: step.to_string(),
                expected: kind_list(kinds),
                actual: event.kind().name().to_string(),
            });
        }

        let key = CollectionKey {
            step: step.to_string(),
            kinds: kinds.to_vec(),
        };

        let mut buffers = self.buffers.lock().await;
        let collection = buffers.entry(key.clone()).or_insert_with(|| Collection {
            expected,
            arrived: Vec::with_capacity(expected),
        });
        collection.expected = expected;
        collection.arrived.push(event);

        debug!(
            step,
            arrived = collection.arrived.len(),
            expected,
            "fan-in arrival"
        );

        if collection.arrived.len() < collection.expected {
            return Ok(None);
        }

        Ok(buffers.remove(&key).map(|c| c.arrived))
    }

    /// Describes every buffer still waiting, e.g.
    /// `fan_in waiting for ContractIndexed (2/3)`.
    pub(crate) async fn pending(&self) -> Vec<String> {
        let buffers = self.buffers.lock().await;
        let mut pending: Vec<String> = buffers
            .iter()
            .map(|(key, c)| {
                format!(
                    "{} waiting for {} ({}/{})",
                    key.step,
                    kind_list(&key.kinds),
                    c.arrived.len(),
                    c.expected
                )
            })
            .collect();
        pending.sort();
        pending
    }
}

fn kind_list(kinds: &[EventKind]) -> String {
    kinds
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[derive(Debug)]
    struct Indexed(u32);
    impl Event for Indexed {}

    #[derive(Debug)]
    struct IndexFailed;
    impl Event for IndexFailed {}

    fn kinds() -> Vec<EventKind> {
        vec![EventKind::of::<Indexed>()]
    }

    #[tokio::test]
    async fn test_releases_once_in_arrival_order() {
        let collector = EventCollector::new();

        for n in [2, 0] {
            let released = collector
                .collect("fan_in", AnyEvent::new(Indexed(n)), &kinds(), 3)
                .await
                .unwrap();
            assert!(released.is_none());
        }

        let released = collector
            .collect("fan_in", AnyEvent::new(Indexed(1)), &kinds(), 3)
            .await
            .unwrap()
            .unwrap();

        let order: Vec<u32> = released
            .iter()
            .map(|e| e.downcast_ref::<Indexed>().unwrap().0)
            .collect();
        assert_eq!(order, vec![2, 0, 1]);
        assert!(collector.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_describes_incomplete_buffers() {
        let collector = EventCollector::new();
        collector
            .collect("fan_in", AnyEvent::new(Indexed(0)), &kinds(), 3)
            .await
            .unwrap();

        assert_eq!(
            collector.pending().await,
            vec!["fan_in waiting for Indexed (1/3)".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failure_kinds_count_toward_total() {
        let collector = EventCollector::new();
        let both = vec![EventKind::of::<Indexed>(), EventKind::of::<IndexFailed>()];

        collector
            .collect("fan_in", AnyEvent::new(Indexed(0)), &both, 2)
            .await
            .unwrap();
        let released = collector
            .collect("fan_in", AnyEvent::new(IndexFailed), &both, 2)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(released.len(), 2);
        assert!(released[1].is::<IndexFailed>());
    }

    #[tokio::test]
    async fn test_rejects_foreign_kind_and_zero_total() {
        let collector = EventCollector::new();

        let err = collector
            .collect("fan_in", AnyEvent::new(IndexFailed), &kinds(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::UnexpectedEvent { .. }));

        let err = collector
            .collect("fan_in", AnyEvent::new(Indexed(0)), &kinds(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, HeddleError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_buffers_are_keyed_by_step() {
        let collector = EventCollector::new();
        collector
            .collect("left", AnyEvent::new(Indexed(0)), &kinds(), 2)
            .await
            .unwrap();
        let released = collector
            .collect("right", AnyEvent::new(Indexed(1)), &kinds(), 2)
            .await
            .unwrap();

        assert!(released.is_none());
        assert_eq!(collector.pending().await.len(), 2);
    }
}
