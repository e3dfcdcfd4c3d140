//! Per-neuron concurrency gating.
//!
//! The data model calls for a `{limit, active, waiters[]}` map with FIFO
//! wakeup. `tokio::sync::Semaphore` already provides exactly that — fair,
//! FIFO-ordered waiters and a permit count — so the gate is a thin wrapper
//! rather than a hand-rolled waiter queue.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::neuron::Neuron;

pub struct NeuronGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl NeuronGate {
    pub fn new(limit: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(limit)), limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of slots currently in use. Only meaningful for introspection
    /// (tests, metrics) — it is read without holding any lock of its own.
    pub fn active(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Acquire a slot, suspending in FIFO order if the gate is saturated.
    /// The returned permit releases the slot (and wakes the next FIFO
    /// waiter) when dropped, regardless of whether the caller's work
    /// succeeded, failed, or was cancelled.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed")
    }
}

/// Registry of per-neuron gates, built once at facade construction and
/// shared across every stimulation on that facade — concurrency limits are a
/// property of the neuron, not of any one cascade.
#[derive(Default)]
pub struct GateRegistry {
    gates: DashMap<String, Arc<NeuronGate>>,
}

impl GateRegistry {
    pub fn build(neurons: &[Neuron]) -> Self {
        let gates = DashMap::new();
        for neuron in neurons {
            if let Some(limit) = neuron.concurrency() {
                gates.insert(neuron.name().to_string(), Arc::new(NeuronGate::new(limit)));
            }
        }
        Self { gates }
    }

    /// `None` means the neuron has no concurrency limit: callers should run
    /// the work directly, unbounded.
    pub fn get(&self, neuron_name: &str) -> Option<Arc<NeuronGate>> {
        self.gates.get(neuron_name).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn gate_never_exceeds_its_limit() {
        let gate = Arc::new(NeuronGate::new(2));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let active = gate.active();
                peak.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn unbounded_neurons_have_no_gate() {
        let registry = GateRegistry::default();
        assert!(registry.get("anything").is_none());
    }

    #[test]
    fn saturated_gate_suspends_the_next_acquire() {
        let gate = NeuronGate::new(1);
        let _first = tokio_test::block_on(gate.acquire());
        let mut waiter = tokio_test::task::spawn(gate.acquire());
        tokio_test::assert_pending!(waiter.poll());
    }
}
