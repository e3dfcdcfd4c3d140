//! `neurobus` — a cooperative, typed signal propagation core for
//! neuron-inspired in-process event buses.
//!
//! A topology of [`Neuron`]s is declared once: each neuron owns an
//! [`Axon`] (its output channels) and a set of [`Dendrite`]s (handlers
//! reacting to other neurons' output). A [`Cns`] facade validates that
//! topology, and [`Cns::stimulate`] drives the resulting cascade of
//! reactions — breadth-first, deduplicated, hop-capped, and per-neuron
//! concurrency-gated — to completion.
//!
//! ```no_run
//! use neurobus::{Axon, Cns, Collateral, Dendrite, FacadeOptions, Neuron, ReactionOutput, StimulationOptions};
//!
//! # async fn run() -> neurobus::Result<()> {
//! let x = Collateral::<u32>::new("x");
//! let y = Collateral::<u32>::new("y");
//!
//! let a = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
//! let y_for_b = y.clone();
//! let b = Neuron::new("B", Axon::builder().with("y", &y).build())
//!     .dendrite(Dendrite::sync(&x, move |payload, _axon, _ctx| {
//!         Ok(ReactionOutput::One(y_for_b.create_signal(*payload + 1)))
//!     }))
//!     .build();
//!
//! let cns = Cns::new(vec![a, b], FacadeOptions::default())?;
//! let handle = cns.stimulate(vec![x.create_signal(1)], StimulationOptions::default());
//! handle.wait_until_complete().await?;
//! # Ok(())
//! # }
//! ```

pub mod abort;
pub mod collateral;
pub mod context;
pub mod dedup_cascade;
pub mod error;
pub mod facade;
pub mod gate;
pub mod graph;
pub mod neuron;
pub mod pump;
pub mod stimulation;
mod deque;
mod topology;

pub use abort::AbortHandle;
pub use collateral::{Collateral, CollateralId, ReactionOutput, Signal};
pub use context::{ContextStore, ContextValue};
pub use dedup_cascade::{run as run_dedup_cascade, AllowType, DedupCascadeOptions};
pub use error::{NeuronError, Result, TopologyIssue};
pub use facade::{Cns, FacadeOptions, ResponseListener};
pub use gate::{GateRegistry, NeuronGate};
pub use graph::{ActiveSccCounts, GraphAnalyzer};
pub use neuron::{Axon, AxonBuilder, BoxFuture, Dendrite, LocalContext, Neuron, NeuronBuilder, ReactionFuture, ReactionResult};
pub use stimulation::{
    ActivationTask, FailedTask, OnResponseFn, ResponseRecord, StimulationConfig, StimulationDriver,
    StimulationHandle, StimulationOptions,
};
pub use topology::Subscriber;
