//! The lightweight alternate BFS cascade (the data model's "dedup mode"):
//! fire-and-forget fan-out with an `allowType` filter and a flat hop cap,
//! for callers who don't need per-neuron concurrency gating, a completion
//! future, or failed-task tracking — just "run this to quiescence."
//!
//! This is the simpler of the two cascade shapes the data model describes;
//! [`crate::stimulation::StimulationDriver`] is the forward one. Individual
//! handler failures here are logged and dropped, not collected, since this
//! mode has no completion future for them to be surfaced through.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::abort::AbortHandle;
use crate::collateral::Signal;
use crate::context::ContextStore;
use crate::facade::Cns;
use crate::neuron::LocalContext;

pub type AllowType = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
pub struct DedupCascadeOptions {
    /// When set, a collateral not accepted by this predicate is dropped
    /// instead of fanned out — neither dispatched to subscribers nor
    /// re-enqueued.
    pub allow_type: Option<AllowType>,
    pub max_hops: Option<u32>,
    pub spike_id: Option<String>,
}

struct State {
    deque: VecDeque<(Signal, u32)>,
    dispatched: HashSet<(String, String, u32)>,
    outstanding: usize,
}

/// Drive a fire-and-forget cascade to quiescence. Every subscriber
/// invocation is spawned independently; its output, if any, feeds back into
/// the same deque at `hops + 1`. Resolves once the deque is empty and every
/// spawned subscriber has settled.
pub async fn run(cns: Cns, roots: Vec<Signal>, options: DedupCascadeOptions) {
    let spike_id: Arc<str> = Arc::from(options.spike_id.unwrap_or_else(crate::stimulation::short_id));
    let allow_type = options.allow_type;
    let max_hops = options.max_hops;

    let state = Arc::new(Mutex::new(State {
        deque: roots.into_iter().map(|s| (s, 0)).collect(),
        dispatched: HashSet::new(),
        outstanding: 0,
    }));
    let notify = Arc::new(Notify::new());

    loop {
        let batch: VecDeque<(Signal, u32)> = {
            let mut guard = state.lock();
            std::mem::take(&mut guard.deque)
        };

        if batch.is_empty() {
            if state.lock().outstanding == 0 {
                break;
            }
            notify.notified().await;
            continue;
        }

        for (signal, hops) in batch {
            if let Some(allow) = &allow_type {
                if !allow(signal.collateral_name()) {
                    continue;
                }
            }
            if max_hops.is_some_and(|limit| hops > limit) {
                continue;
            }

            for subscriber in cns.subscribers(signal.collateral_name()) {
                let identity = (subscriber.neuron_name.clone(), signal.collateral_name().to_string(), hops);
                {
                    let mut guard = state.lock();
                    if !guard.dispatched.insert(identity) {
                        continue;
                    }
                    guard.outstanding += 1;
                }

                let Some(neuron) = cns.neuron_by_name(&subscriber.neuron_name) else {
                    warn!(neuron = %subscriber.neuron_name, "dedup cascade: subscriber missing; dropping");
                    state.lock().outstanding -= 1;
                    continue;
                };
                let dendrite_index = subscriber.dendrite_index;
                let signal = signal.clone();
                let state = Arc::clone(&state);
                let notify = Arc::clone(&notify);
                let cns = cns.clone();
                let spike_id = Arc::clone(&spike_id);

                tokio::spawn(async move {
                    let axon = Arc::clone(neuron.axon());
                    let ctx = LocalContext::new(
                        Arc::from(neuron.name()),
                        Arc::new(ContextStore::new()),
                        AbortHandle::new(),
                        cns,
                        spike_id,
                    );
                    let dendrite = &neuron.dendrites()[dendrite_index];
                    match dendrite.invoke(signal, axon, ctx).await {
                        Ok(output) => {
                            let mut guard = state.lock();
                            for child in output.into_signals() {
                                guard.deque.push_back((child, hops + 1));
                            }
                            guard.outstanding -= 1;
                        }
                        Err(err) => {
                            warn!(neuron = neuron.name(), error = %err, "fire-and-forget subscriber failed");
                            state.lock().outstanding -= 1;
                        }
                    }
                    notify.notify_one();
                });
            }
        }
    }
}
