//! The CNS facade: validates topology at construction, owns the shared
//! per-neuron gate registry and the (optional) SCC analyzer, and starts
//! stimulations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::collateral::{CollateralId, Signal};
use crate::error::{NeuronError, Result};
use crate::gate::GateRegistry;
use crate::graph::{ActiveSccCounts, GraphAnalyzer};
use crate::neuron::{Dendrite, Neuron};
use crate::stimulation::{ResponseRecord, StimulationHandle, StimulationOptions};
use crate::topology::{Subscriber, TopologyIndex};

pub type ResponseListener = Arc<dyn Fn(&ResponseRecord) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FacadeOptions {
    /// When true, the facade builds an SCC analyzer and every stimulation on
    /// it tracks per-SCC active-neuron counts so it can delete a neuron's
    /// context entry as soon as it is provably unreachable again.
    pub auto_cleanup_contexts: bool,
}

struct CnsInner {
    topology: TopologyIndex,
    neurons: Vec<Neuron>,
    gates: GateRegistry,
    graph: Option<GraphAnalyzer>,
    listeners: RwLock<Vec<(u64, ResponseListener)>>,
    next_listener_id: AtomicU64,
}

/// The facade. Cheap to clone — every stimulation holds its own `Cns` clone
/// rather than a borrow, since a stimulation outlives the call that created
/// it.
#[derive(Clone)]
pub struct Cns(Arc<CnsInner>);

impl std::fmt::Debug for Cns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cns").finish_non_exhaustive()
    }
}

impl Cns {
    pub fn new(neurons: Vec<Neuron>, options: FacadeOptions) -> Result<Self> {
        let topology = TopologyIndex::build(&neurons).map_err(NeuronError::Topology)?;
        let gates = GateRegistry::build(&neurons);
        let graph = options.auto_cleanup_contexts.then(|| GraphAnalyzer::build(&topology));
        Ok(Self(Arc::new(CnsInner {
            topology,
            neurons,
            gates,
            graph,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        })))
    }

    /// A facade over an empty topology. Used to build standalone
    /// [`crate::neuron::LocalContext`] values in unit tests that exercise a
    /// dendrite in isolation, without a running stimulation.
    pub fn for_test() -> Self {
        Self::new(Vec::new(), FacadeOptions::default()).expect("an empty topology always validates")
    }

    pub(crate) fn topology(&self) -> &TopologyIndex {
        &self.0.topology
    }

    pub(crate) fn gates(&self) -> &GateRegistry {
        &self.0.gates
    }

    pub(crate) fn graph(&self) -> Option<&GraphAnalyzer> {
        self.0.graph.as_ref()
    }

    pub(crate) fn notify_listeners(&self, record: &ResponseRecord) {
        let snapshot: Vec<ResponseListener> =
            self.0.listeners.read().iter().map(|(_, f)| Arc::clone(f)).collect();
        for listener in snapshot {
            if let Err(err) = listener(record) {
                warn!(error = %err, "global response listener failed; ignoring and continuing the chain");
            }
        }
    }

    /// Subscribe a global observer of every response across every
    /// stimulation on this facade. Returns an unsubscribe closure.
    pub fn add_response_listener(&self, listener: ResponseListener) -> impl Fn() + Send + Sync + 'static {
        let id = self.0.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.0.listeners.write().push((id, listener));
        let inner = Arc::clone(&self.0);
        move || inner.listeners.write().retain(|(existing, _)| *existing != id)
    }

    /// Construct and start a stimulation cascade from one or more root
    /// signals. Returns immediately with a handle; the cascade itself runs
    /// on a spawned task.
    pub fn stimulate(&self, signals: impl Into<Vec<Signal>>, options: StimulationOptions) -> StimulationHandle {
        crate::stimulation::StimulationDriver::start(self.clone(), signals.into(), options)
    }

    // --- Query helpers (§6) ---

    pub fn neurons(&self) -> &[Neuron] {
        &self.0.neurons
    }

    pub fn neuron_by_name(&self, name: &str) -> Option<Neuron> {
        self.0.topology.neuron_index(name).map(|i| self.0.neurons[i].clone())
    }

    pub fn collaterals(&self) -> Vec<CollateralId> {
        self.0.topology.collaterals().cloned().collect()
    }

    pub fn collateral_by_name(&self, name: &str) -> Option<&CollateralId> {
        self.0.topology.collateral_by_name(name)
    }

    pub fn dendrites(&self) -> Vec<(&str, &Dendrite)> {
        self.0.neurons.iter().flat_map(|n| n.dendrites().iter().map(move |d| (n.name(), d))).collect()
    }

    pub fn subscribers(&self, collateral_name: &str) -> &[Subscriber] {
        self.0.topology.subscribers(collateral_name)
    }

    pub fn parent_neuron_by_collateral_name(&self, name: &str) -> Option<&str> {
        self.0.topology.owner_neuron(name)
    }

    // --- Graph helpers (§6) ---

    pub fn strongly_connected_components(&self) -> Vec<HashSet<String>> {
        self.0.graph.as_ref().map(GraphAnalyzer::strongly_connected_components).unwrap_or_default()
    }

    pub fn scc_index_by_neuron_name(&self, name: &str) -> Option<usize> {
        self.0.graph.as_ref().and_then(|g| g.scc_of(name))
    }

    pub fn can_neuron_be_guaranteed_done(&self, name: &str, active: &ActiveSccCounts) -> bool {
        self.0.graph.as_ref().map(|g| g.can_neuron_be_guaranteed_done(name, active)).unwrap_or(true)
    }
}
