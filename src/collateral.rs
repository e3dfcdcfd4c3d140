//! Collaterals and signals — the typed channels and the values that flow
//! through them.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{NeuronError, Result};

/// Type-erased identity of a [`Collateral`], used once a topology is built
/// and no longer needs the compile-time payload type.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CollateralId(Arc<str>);

impl CollateralId {
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Construct an id directly from a name, bypassing a typed [`Collateral`].
    /// Used by the topology index when it only has a dendrite's collateral
    /// name on hand (the dendrite's own payload type isn't visible there).
    pub fn new_raw(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }
}

impl From<&str> for CollateralId {
    fn from(value: &str) -> Self {
        CollateralId::new_raw(value)
    }
}

impl fmt::Debug for CollateralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollateralId({})", self.0)
    }
}

impl fmt::Display for CollateralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An identity for a typed channel. `name` is globally unique within a
/// topology; the payload type `T` only exists at compile time — once a
/// [`Signal`] is materialized the payload is type-erased so the dispatcher
/// can fan out across collaterals of different payload types.
pub struct Collateral<T> {
    id: CollateralId,
    _payload: PhantomData<fn() -> T>,
}

// Manual impls: `T` never actually appears in a field, so `Collateral<T>`
// should be Clone/Send/Sync regardless of T's own bounds.
impl<T> Clone for Collateral<T> {
    fn clone(&self) -> Self {
        Self { id: self.id.clone(), _payload: PhantomData }
    }
}

unsafe impl<T> Send for Collateral<T> {}
unsafe impl<T> Sync for Collateral<T> {}

impl<T: Send + Sync + 'static> Collateral<T> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { id: CollateralId(name.into()), _payload: PhantomData }
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn id(&self) -> CollateralId {
        self.id.clone()
    }

    /// Materialize a `Signal{name, payload}` for this collateral.
    pub fn create_signal(&self, payload: T) -> Signal {
        Signal {
            collateral_name: self.id.clone(),
            payload: Arc::new(payload),
        }
    }
}

impl<T> fmt::Debug for Collateral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Collateral({})", self.id)
    }
}

/// A materialized `{collateralName, payload}` pair flowing through the
/// cascade. Payloads are type-erased; handlers recover the concrete type
/// with [`Signal::payload`].
#[derive(Clone)]
pub struct Signal {
    collateral_name: CollateralId,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Signal {
    pub fn collateral_name(&self) -> &str {
        self.collateral_name.name()
    }

    pub fn collateral_id(&self) -> CollateralId {
        self.collateral_name.clone()
    }

    /// Downcast the payload. Returns [`NeuronError::PayloadTypeMismatch`] if
    /// the caller's `T` doesn't match the type the signal was created with —
    /// per the data model, a mismatched collateral/payload pairing is a
    /// contract violation the core never enforces at routing time, but a
    /// handler is still entitled to fail loudly when it reads one.
    pub fn payload<T: Send + Sync + 'static>(&self) -> Result<&T> {
        self.payload
            .downcast_ref::<T>()
            .ok_or_else(|| NeuronError::PayloadTypeMismatch(self.collateral_name.to_string()))
    }

    pub fn payload_arc<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        Arc::clone(&self.payload)
            .downcast::<T>()
            .map_err(|_| NeuronError::PayloadTypeMismatch(self.collateral_name.to_string()))
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("collateral_name", &self.collateral_name.name())
            .field("payload", &"<erased>")
            .finish()
    }
}

/// What a dendrite's reaction produced: nothing, one signal, or an ordered
/// finite sequence of signals. The "lazy future" arm from the data model
/// doesn't need a variant here — in this implementation every reaction is
/// already a future ([`crate::neuron::ReactionFuture`]); a "synchronous"
/// reaction is simply one whose future is immediately ready.
#[derive(Debug, Clone, Default)]
pub enum ReactionOutput {
    #[default]
    Empty,
    One(Signal),
    Many(Vec<Signal>),
}

impl ReactionOutput {
    /// Normalize into an ordered list of zero or more signals — the single
    /// site §4.6 step 6 calls for before fan-out.
    pub fn into_signals(self) -> Vec<Signal> {
        match self {
            ReactionOutput::Empty => Vec::new(),
            ReactionOutput::One(s) => vec![s],
            ReactionOutput::Many(v) => v,
        }
    }
}

impl From<Signal> for ReactionOutput {
    fn from(s: Signal) -> Self {
        ReactionOutput::One(s)
    }
}

impl From<Vec<Signal>> for ReactionOutput {
    fn from(v: Vec<Signal>) -> Self {
        ReactionOutput::Many(v)
    }
}

impl From<Option<Signal>> for ReactionOutput {
    fn from(v: Option<Signal>) -> Self {
        match v {
            Some(s) => ReactionOutput::One(s),
            None => ReactionOutput::Empty,
        }
    }
}
