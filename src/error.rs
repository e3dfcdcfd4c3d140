//! Error types for the signal propagation core.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NeuronError>;

/// A single topology validation failure, named so the constructor can
/// aggregate every offending neuron/collateral into one error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyIssue {
    #[error("neuron name is empty")]
    EmptyNeuronName,

    #[error("duplicate neuron name: {0}")]
    DuplicateNeuron(String),

    #[error("duplicate collateral name: {0}")]
    DuplicateCollateral(String),
}

#[derive(Error, Debug, Clone)]
pub enum NeuronError {
    #[error("topology validation failed: {0:?}")]
    Topology(Vec<TopologyIssue>),

    #[error("unknown collateral: {0}")]
    UnknownCollateral(String),

    #[error("unknown neuron: {0}")]
    UnknownNeuron(String),

    #[error("no subscriber resolved for collateral: {0}")]
    SubscriberMissing(String),

    #[error("neuron {neuron} did not settle within {max_duration_ms}ms")]
    Timeout { neuron: String, max_duration_ms: u64 },

    #[error("neuron {neuron} exceeded its hop limit of {limit}")]
    HopLimitExceeded { neuron: String, limit: u32 },

    #[error("stimulation aborted")]
    Aborted,

    #[error("signal payload did not match the expected type for collateral {0}")]
    PayloadTypeMismatch(String),

    #[error("dendrite handler failed: {0}")]
    Handler(Arc<anyhow::Error>),

    #[error("stimulation completed with {0} failed task(s)")]
    Aggregate(usize),

    #[error("onResponse listener failed: {0}")]
    Listener(Arc<anyhow::Error>),
}

impl NeuronError {
    pub fn handler(err: anyhow::Error) -> Self {
        Self::Handler(Arc::new(err))
    }

    pub fn listener(err: anyhow::Error) -> Self {
        Self::Listener(Arc::new(err))
    }
}
