//! Neurons, axons and dendrites — the declarative shape of a topology.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::abort::AbortHandle;
use crate::collateral::{Collateral, CollateralId, ReactionOutput, Signal};
use crate::context::{ContextStore, ContextValue};
use crate::facade::Cns;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a dendrite's reaction future resolves to.
pub type ReactionResult = anyhow::Result<ReactionOutput>;

/// The boxed, type-erased future a dendrite invocation produces. A
/// "synchronous" reaction is simply one built from an already-ready future —
/// the pump and stimulation driver never distinguish the two paths, they
/// just `.await` this.
pub type ReactionFuture = BoxFuture<'static, ReactionResult>;

type ReactionFn = dyn Fn(Signal, Arc<Axon>, LocalContext) -> ReactionFuture + Send + Sync;

/// A neuron's output channel set: a mapping from a local key to the
/// [`Collateral`] the neuron may emit signals on. Payload types are erased
/// here (an `Axon` is stored on a non-generic [`Neuron`]); they only matter
/// again once a handler calls `Collateral::<T>::create_signal`.
#[derive(Default, Clone)]
pub struct Axon {
    outputs: HashMap<String, CollateralId>,
}

impl Axon {
    pub fn builder() -> AxonBuilder {
        AxonBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&CollateralId> {
        self.outputs.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn collaterals(&self) -> impl Iterator<Item = &CollateralId> {
        self.outputs.values()
    }
}

#[derive(Default)]
pub struct AxonBuilder {
    outputs: HashMap<String, CollateralId>,
}

impl AxonBuilder {
    pub fn with<T: Send + Sync + 'static>(mut self, key: impl Into<String>, collateral: &Collateral<T>) -> Self {
        self.outputs.insert(key.into(), collateral.id());
        self
    }

    pub fn build(self) -> Axon {
        Axon { outputs: self.outputs }
    }
}

/// A reaction rule owned by a neuron: which input collateral it reacts to,
/// and the handler invoked with `(payload, axon, localCtx)`.
pub struct Dendrite {
    collateral_name: String,
    handler: Arc<ReactionFn>,
}

impl Clone for Dendrite {
    fn clone(&self) -> Self {
        Self { collateral_name: self.collateral_name.clone(), handler: Arc::clone(&self.handler) }
    }
}

impl Dendrite {
    /// Build a dendrite whose handler is async and strongly typed on its
    /// input payload. `handler` receives the already-downcast payload; a
    /// type mismatch at dispatch time (a mis-wired topology) surfaces as a
    /// failed task rather than a panic.
    pub fn new<T, F, Fut>(collateral: &Collateral<T>, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, Arc<Axon>, LocalContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReactionResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Dendrite {
            collateral_name: collateral.name().to_string(),
            handler: Arc::new(move |signal: Signal, axon: Arc<Axon>, ctx: LocalContext| -> ReactionFuture {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let payload = signal.payload_arc::<T>()?;
                    handler(payload, axon, ctx).await
                })
            }),
        }
    }

    /// Build a dendrite whose handler is synchronous; its return value is
    /// wrapped in an already-ready future so the dispatcher can treat it
    /// identically to an async reaction.
    pub fn sync<T, F>(collateral: &Collateral<T>, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, Arc<Axon>, LocalContext) -> ReactionResult + Send + Sync + 'static,
    {
        Self::new(collateral, move |payload, axon, ctx| {
            std::future::ready(handler(payload, axon, ctx))
        })
    }

    pub fn collateral_name(&self) -> &str {
        &self.collateral_name
    }

    pub(crate) fn invoke(&self, signal: Signal, axon: Arc<Axon>, ctx: LocalContext) -> ReactionFuture {
        (self.handler)(signal, axon, ctx)
    }
}

impl fmt::Debug for Dendrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dendrite").field("collateral_name", &self.collateral_name).finish()
    }
}

/// A named unit owning an output channel set (axon) and an ordered sequence
/// of input handlers (dendrites). Cheap to clone: every field is either an
/// `Arc`, a `String`/`Vec` of `Arc`-backed dendrites, or `Copy`. The
/// stimulation driver clones the `Neuron` it is about to activate into its
/// spawned task rather than threading a borrow through an `.await`.
#[derive(Clone)]
pub struct Neuron {
    name: String,
    axon: Arc<Axon>,
    dendrites: Vec<Dendrite>,
    /// Positive concurrency limit; `None` means unbounded.
    concurrency: Option<usize>,
    /// `None` means no per-invocation timeout.
    max_duration: Option<Duration>,
}

impl Neuron {
    pub fn new(name: impl Into<String>, axon: Axon) -> NeuronBuilder {
        NeuronBuilder {
            name: name.into(),
            axon,
            dendrites: Vec::new(),
            concurrency: None,
            max_duration: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn axon(&self) -> &Arc<Axon> {
        &self.axon
    }

    pub fn dendrites(&self) -> &[Dendrite] {
        &self.dendrites
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }
}

impl fmt::Debug for Neuron {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Neuron")
            .field("name", &self.name)
            .field("dendrites", &self.dendrites.len())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

pub struct NeuronBuilder {
    name: String,
    axon: Axon,
    dendrites: Vec<Dendrite>,
    concurrency: Option<usize>,
    max_duration: Option<Duration>,
}

impl NeuronBuilder {
    /// Absent or `<= 0` means unbounded, per the data model.
    pub fn concurrency(mut self, limit: i64) -> Self {
        self.concurrency = if limit > 0 { Some(limit as usize) } else { None };
        self
    }

    /// Absent or `<= 0` means no timeout, per the data model.
    pub fn max_duration(mut self, millis: i64) -> Self {
        self.max_duration = if millis > 0 { Some(Duration::from_millis(millis as u64)) } else { None };
        self
    }

    pub fn dendrite(mut self, dendrite: Dendrite) -> Self {
        self.dendrites.push(dendrite);
        self
    }

    pub fn build(self) -> Neuron {
        Neuron {
            name: self.name,
            axon: Arc::new(self.axon),
            dendrites: self.dendrites,
            concurrency: self.concurrency,
            max_duration: self.max_duration,
        }
    }
}

/// The view a dendrite handler gets into the running stimulation: a slot in
/// the per-neuron context store, the abort signal, the owning facade, and
/// the stimulation id, all scoped to the neuron that owns the dendrite.
#[derive(Clone)]
pub struct LocalContext {
    neuron_name: Arc<str>,
    context: Arc<ContextStore>,
    abort_signal: AbortHandle,
    cns: Cns,
    stimulation_id: Arc<str>,
}

impl LocalContext {
    pub fn new(
        neuron_name: Arc<str>,
        context: Arc<ContextStore>,
        abort_signal: AbortHandle,
        cns: Cns,
        stimulation_id: Arc<str>,
    ) -> Self {
        Self { neuron_name, context, abort_signal, cns, stimulation_id }
    }

    pub fn get(&self) -> Option<ContextValue> {
        self.context.get(&self.neuron_name)
    }

    pub fn set(&self, value: ContextValue) {
        self.context.set(&self.neuron_name, value);
    }

    pub fn delete(&self) {
        self.context.delete(&self.neuron_name);
    }

    pub fn abort_signal(&self) -> &AbortHandle {
        &self.abort_signal
    }

    pub fn cns(&self) -> &Cns {
        &self.cns
    }

    pub fn stimulation_id(&self) -> &str {
        &self.stimulation_id
    }
}
