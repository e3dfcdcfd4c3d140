//! Tarjan SCC over the neuron graph, its condensation DAG, and the
//! ancestor-closure bookkeeping that backs safe early context cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::warn;

use crate::topology::TopologyIndex;

/// Per-SCC active-neuron counters. Activation of a neuron increments its
/// SCC's counter; completion decrements it. A decrement that would underflow
/// is clamped at zero and logged — it should never happen, since completion
/// is always paired with a prior activation, but the counters are shared
/// mutable state touched from multiple driver call sites and we'd rather
/// warn than panic.
pub struct ActiveSccCounts {
    counts: Vec<AtomicI64>,
}

impl ActiveSccCounts {
    pub fn new(scc_count: usize) -> Self {
        Self { counts: (0..scc_count).map(|_| AtomicI64::new(0)).collect() }
    }

    pub fn increment(&self, scc: usize) {
        if let Some(c) = self.counts.get(scc) {
            c.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn decrement(&self, scc: usize) {
        if let Some(c) = self.counts.get(scc) {
            let prev = c.fetch_sub(1, Ordering::SeqCst);
            if prev <= 0 {
                warn!(scc, "active SCC count underflow on decrement; clamping to zero");
                c.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn is_active(&self, scc: usize) -> bool {
        self.counts.get(scc).map(|c| c.load(Ordering::SeqCst) > 0).unwrap_or(false)
    }
}

/// Strongly-connected-component analysis of the directed neuron graph, used
/// to bound per-neuron context lifetime safely during a running cascade.
pub struct GraphAnalyzer {
    scc_of_neuron: HashMap<String, usize>,
    scc_members: Vec<HashSet<String>>,
    /// For each SCC, the set of SCCs (including itself is never included)
    /// that can reach it through the condensation DAG.
    ancestors: Vec<HashSet<usize>>,
}

impl GraphAnalyzer {
    pub fn build(topology: &TopologyIndex) -> Self {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_of_name: HashMap<String, NodeIndex> = HashMap::new();

        for name in topology.neuron_names() {
            let idx = graph.add_node(name.clone());
            node_of_name.insert(name.clone(), idx);
        }
        for (from, to) in topology.edges() {
            if let (Some(&u), Some(&v)) = (node_of_name.get(&from), node_of_name.get(&to)) {
                graph.add_edge(u, v, ());
            }
        }

        // `tarjan_scc` returns components in reverse topological order; the
        // index into that Vec is our stable SCC id for the rest of this
        // analyzer's life.
        let components = tarjan_scc(&graph);
        let mut scc_of_neuron = HashMap::with_capacity(graph.node_count());
        let mut scc_members = Vec::with_capacity(components.len());
        for (scc_index, members) in components.iter().enumerate() {
            let mut name_set = HashSet::with_capacity(members.len());
            for &node in members {
                let name = graph[node].clone();
                scc_of_neuron.insert(name.clone(), scc_index);
                name_set.insert(name);
            }
            scc_members.push(name_set);
        }

        // Condensation: one node per SCC, an edge scc_u -> scc_v for every
        // inter-SCC edge in the original graph.
        let mut condensation: DiGraph<usize, ()> = DiGraph::new();
        let condensation_nodes: Vec<NodeIndex> =
            (0..scc_members.len()).map(|i| condensation.add_node(i)).collect();
        let mut seen_edges = HashSet::new();
        for edge in graph.edge_indices() {
            let (u, v) = graph.edge_endpoints(edge).expect("edge index from this graph");
            let su = scc_of_neuron[&graph[u]];
            let sv = scc_of_neuron[&graph[v]];
            if su != sv && seen_edges.insert((su, sv)) {
                condensation.add_edge(condensation_nodes[su], condensation_nodes[sv], ());
            }
        }

        // Ancestor closure via a Kahn topological sweep: process SCCs in
        // topological order (a condensation is always a DAG) and propagate
        // each processed SCC's ancestor set — plus itself — forward to its
        // successors.
        let order = toposort(&condensation, None).expect("condensation of an SCC graph is acyclic");
        let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); scc_members.len()];
        for node in order {
            let scc = condensation[node];
            let this_and_ancestors: HashSet<usize> =
                ancestors[scc].iter().copied().chain(std::iter::once(scc)).collect();
            for succ in condensation.neighbors(node) {
                let succ_scc = condensation[succ];
                ancestors[succ_scc].extend(this_and_ancestors.iter().copied());
            }
        }

        Self { scc_of_neuron, scc_members, ancestors }
    }

    pub fn scc_count(&self) -> usize {
        self.scc_members.len()
    }

    pub fn scc_of(&self, neuron_name: &str) -> Option<usize> {
        self.scc_of_neuron.get(neuron_name).copied()
    }

    pub fn members(&self, scc: usize) -> Option<&HashSet<String>> {
        self.scc_members.get(scc)
    }

    pub fn strongly_connected_components(&self) -> Vec<HashSet<String>> {
        self.scc_members.clone()
    }

    /// True when: (a) the neuron's SCC currently has zero active neurons,
    /// and (b) no SCC in its ancestor closure has any active neuron. This is
    /// the exact safety condition for deleting a neuron's context slot mid
    /// cascade — if neither the enclosing SCC nor any ancestor is active, no
    /// future task in this stimulation can reach this neuron again.
    pub fn can_neuron_be_guaranteed_done(&self, neuron_name: &str, active: &ActiveSccCounts) -> bool {
        let Some(scc) = self.scc_of(neuron_name) else { return true };
        if active.is_active(scc) {
            return false;
        }
        self.ancestors[scc].iter().all(|&ancestor| !active.is_active(ancestor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collateral::{Collateral, ReactionOutput};
    use crate::neuron::{Axon, Dendrite, Neuron};

    fn cyclic_pair() -> Vec<Neuron> {
        let a_out = Collateral::<u32>::new("a");
        let b_out = Collateral::<u32>::new("b");

        let b_out2 = b_out.clone();
        let a = Neuron::new("A", Axon::builder().with("a", &a_out).build())
            .dendrite(Dendrite::sync(&b_out, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(b_out2.create_signal(*p)))
            }))
            .build();

        let a_out2 = a_out.clone();
        let b = Neuron::new("B", Axon::builder().with("b", &b_out).build())
            .dendrite(Dendrite::sync(&a_out, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(a_out2.create_signal(*p)))
            }))
            .build();

        vec![a, b]
    }

    #[test]
    fn cyclic_pair_forms_one_scc() {
        let neurons = cyclic_pair();
        let topo = TopologyIndex::build(&neurons).unwrap();
        let analyzer = GraphAnalyzer::build(&topo);
        assert_eq!(analyzer.scc_count(), 1);
        assert_eq!(analyzer.scc_of("A"), analyzer.scc_of("B"));
    }

    #[test]
    fn linear_chain_has_no_shared_ancestors_once_done() {
        let x = Collateral::<u32>::new("x");
        let y = Collateral::<u32>::new("y");
        let y2 = y.clone();
        let a = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
        let b = Neuron::new("B", Axon::builder().with("y", &y).build())
            .dendrite(Dendrite::sync(&x, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(y2.create_signal(*p)))
            }))
            .build();
        let topo = TopologyIndex::build(&[a, b]).unwrap();
        let analyzer = GraphAnalyzer::build(&topo);
        assert_eq!(analyzer.scc_count(), 2);

        let active = ActiveSccCounts::new(analyzer.scc_count());
        // Nothing active yet: both neurons are trivially guaranteed done.
        assert!(analyzer.can_neuron_be_guaranteed_done("A", &active));
        assert!(analyzer.can_neuron_be_guaranteed_done("B", &active));

        let scc_a = analyzer.scc_of("A").unwrap();
        active.increment(scc_a);
        // A's own SCC is active, and B's ancestor closure includes A's SCC.
        assert!(!analyzer.can_neuron_be_guaranteed_done("A", &active));
        assert!(!analyzer.can_neuron_be_guaranteed_done("B", &active));

        active.decrement(scc_a);
        assert!(analyzer.can_neuron_be_guaranteed_done("B", &active));
    }

    #[test]
    fn decrement_below_zero_is_clamped_not_panicking() {
        let active = ActiveSccCounts::new(1);
        active.decrement(0);
        assert!(!active.is_active(0));
    }
}
