//! Activation pump: executes a single activation task to completion,
//! composing the per-neuron gate with the neuron's own timeout.
//!
//! There is no hand-rolled `pumping`/`needsPump` re-entrancy guard here (the
//! data model's two booleans exist to collapse recursive pump requests on a
//! single-threaded cooperative event loop). On tokio each activation is its
//! own spawned task; [`crate::stimulation::StimulationDriver`] serializes
//! all dispatcher-state mutation behind a short-held `parking_lot::Mutex`
//! instead, which gives the same single-writer guarantee without needing a
//! deferred-pump flag.

use std::sync::Arc;

use crate::error::NeuronError;
use crate::gate::GateRegistry;
use crate::neuron::{LocalContext, Neuron, ReactionResult};
use crate::stimulation::ActivationTask;

pub struct ActivationOutcome {
    pub task: ActivationTask,
    pub result: std::result::Result<crate::collateral::ReactionOutput, NeuronError>,
    pub aborted: bool,
}

/// Acquire the neuron's gate slot (if it has one), invoke its dendrite, and
/// race the result against the neuron's `maxDuration` if it has one.
pub async fn run_activation(
    neuron: &Neuron,
    gates: &GateRegistry,
    task: ActivationTask,
    ctx: LocalContext,
) -> ActivationOutcome {
    let dendrite = &neuron.dendrites()[task.dendrite_index];
    let gate = gates.get(neuron.name());
    let _permit = match &gate {
        Some(g) => Some(g.acquire().await),
        None => None,
    };

    let axon = Arc::clone(neuron.axon());
    let signal = task
        .input_signal
        .clone()
        .expect("an activation task always carries the signal that triggered it");

    let invocation = dendrite.invoke(signal, axon, ctx.clone());
    let result: ReactionResult = match neuron.max_duration() {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(r) => r,
            Err(_) => {
                return ActivationOutcome {
                    aborted: ctx.abort_signal().is_aborted(),
                    result: Err(NeuronError::Timeout {
                        neuron: neuron.name().to_string(),
                        max_duration_ms: limit.as_millis() as u64,
                    }),
                    task,
                };
            }
        },
        None => invocation.await,
    };

    ActivationOutcome {
        aborted: ctx.abort_signal().is_aborted(),
        result: result.map_err(NeuronError::handler),
        task,
    }
}
