//! Topology index: the immutable indexes built once from a neuron list.

use std::collections::HashMap;

use crate::collateral::CollateralId;
use crate::error::TopologyIssue;
use crate::neuron::Neuron;

/// `(neuron, dendrite)` pair, indexed by the dendrite's input collateral
/// name, in the order neurons (and their dendrites) were declared.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub neuron_name: String,
    pub dendrite_index: usize,
}

/// Built once in a single pass over the neuron list at facade construction.
/// Immutable for the life of the facade.
#[derive(Debug)]
pub struct TopologyIndex {
    neuron_order: Vec<String>,
    neuron_by_name: HashMap<String, usize>,
    collateral_by_name: HashMap<String, CollateralId>,
    collateral_to_subscribers: HashMap<String, Vec<Subscriber>>,
    collateral_to_owner_neuron: HashMap<String, String>,
}

impl TopologyIndex {
    pub fn build(neurons: &[Neuron]) -> Result<Self, Vec<TopologyIssue>> {
        let mut issues = Vec::new();

        let mut neuron_order = Vec::with_capacity(neurons.len());
        let mut neuron_by_name = HashMap::with_capacity(neurons.len());
        let mut collateral_by_name: HashMap<String, CollateralId> = HashMap::new();
        let mut collateral_to_subscribers: HashMap<String, Vec<Subscriber>> = HashMap::new();
        let mut collateral_to_owner_neuron: HashMap<String, String> = HashMap::new();

        for (index, neuron) in neurons.iter().enumerate() {
            if neuron.name().is_empty() {
                issues.push(TopologyIssue::EmptyNeuronName);
                continue;
            }
            if neuron_by_name.contains_key(neuron.name()) {
                issues.push(TopologyIssue::DuplicateNeuron(neuron.name().to_string()));
                continue;
            }
            neuron_by_name.insert(neuron.name().to_string(), index);
            neuron_order.push(neuron.name().to_string());

            for collateral_id in neuron.axon().collaterals() {
                collateral_by_name
                    .entry(collateral_id.name().to_string())
                    .or_insert_with(|| collateral_id.clone());

                match collateral_to_owner_neuron.get(collateral_id.name()) {
                    None => {
                        collateral_to_owner_neuron
                            .insert(collateral_id.name().to_string(), neuron.name().to_string());
                    }
                    Some(existing) if existing != neuron.name() => {
                        issues.push(TopologyIssue::DuplicateCollateral(collateral_id.name().to_string()));
                    }
                    _ => {}
                }
            }

            for (dendrite_index, dendrite) in neuron.dendrites().iter().enumerate() {
                collateral_by_name
                    .entry(dendrite.collateral_name().to_string())
                    .or_insert_with(|| CollateralId::from(dendrite.collateral_name()));

                collateral_to_subscribers
                    .entry(dendrite.collateral_name().to_string())
                    .or_default()
                    .push(Subscriber { neuron_name: neuron.name().to_string(), dendrite_index });
            }
        }

        if !issues.is_empty() {
            return Err(issues);
        }

        Ok(Self {
            neuron_order,
            neuron_by_name,
            collateral_by_name,
            collateral_to_subscribers,
            collateral_to_owner_neuron,
        })
    }

    pub fn neuron_index(&self, name: &str) -> Option<usize> {
        self.neuron_by_name.get(name).copied()
    }

    pub fn neuron_names(&self) -> &[String] {
        &self.neuron_order
    }

    pub fn collateral_by_name(&self, name: &str) -> Option<&CollateralId> {
        self.collateral_by_name.get(name)
    }

    pub fn collaterals(&self) -> impl Iterator<Item = &CollateralId> {
        self.collateral_by_name.values()
    }

    pub fn subscribers(&self, collateral_name: &str) -> &[Subscriber] {
        self.collateral_to_subscribers
            .get(collateral_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn owner_neuron(&self, collateral_name: &str) -> Option<&str> {
        self.collateral_to_owner_neuron.get(collateral_name).map(String::as_str)
    }

    /// Every neuron that owns at least one axon collateral targeted by some
    /// dendrite — i.e. the edges of the neuron graph, grouped by source.
    /// `u -> v` iff some collateral in `u`'s axon is the input of some
    /// dendrite on `v`.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for (collateral_name, owner) in &self.collateral_to_owner_neuron {
            for subscriber in self.subscribers(collateral_name) {
                edges.push((owner.clone(), subscriber.neuron_name.clone()));
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collateral::Collateral;
    use crate::neuron::{Axon, Dendrite, Neuron};
    use crate::collateral::ReactionOutput;

    fn linear_chain() -> Vec<Neuron> {
        let x = Collateral::<u32>::new("x");
        let y = Collateral::<u32>::new("y");

        let a = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
        let y2 = y.clone();
        let b = Neuron::new("B", Axon::builder().with("y", &y).build())
            .dendrite(Dendrite::sync(&x, move |p, _axon, _ctx| {
                Ok(ReactionOutput::One(y2.create_signal(*p)))
            }))
            .build();
        vec![a, b]
    }

    #[test]
    fn builds_indexes_for_a_linear_chain() {
        let neurons = linear_chain();
        let topo = TopologyIndex::build(&neurons).unwrap();
        assert_eq!(topo.neuron_names(), &["A".to_string(), "B".to_string()]);
        assert_eq!(topo.owner_neuron("x"), Some("A"));
        assert_eq!(topo.subscribers("x").len(), 1);
        assert_eq!(topo.subscribers("x")[0].neuron_name, "B");
        assert_eq!(topo.edges(), vec![("A".to_string(), "B".to_string())]);
    }

    #[test]
    fn duplicate_neuron_names_are_aggregated() {
        let x = Collateral::<u32>::new("x");
        let a1 = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
        let a2 = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
        let err = TopologyIndex::build(&[a1, a2]).unwrap_err();
        assert_eq!(err, vec![TopologyIssue::DuplicateNeuron("A".to_string())]);
    }

    #[test]
    fn empty_neuron_name_is_reported() {
        let x = Collateral::<u32>::new("x");
        let a = Neuron::new("", Axon::builder().with("x", &x).build()).build();
        let err = TopologyIndex::build(&[a]).unwrap_err();
        assert_eq!(err, vec![TopologyIssue::EmptyNeuronName]);
    }
}
