//! Request orchestration layer
//!
//! This module sequences the layers of each request and owns the state
//! shared across requests: rolling statistics, the information-flow log
//! and the background persistence queue.

use std::time::Duration;

use serde::Serialize;

use crate::{config::SystemConfig, stage::InitOutcome};

pub mod executor;
pub mod flow;
pub mod lifecycle;
pub mod metrics;
pub mod persistence;
pub mod stats;
pub mod stream;


pub use executor::{Orchestrator, PipelineResponse, ResponseError, TimingBreakdown};
pub use flow::{FlowType, InformationFlow};
pub use lifecycle::SystemStatus;
pub use stats::StatsSnapshot;
pub use stream::StreamEvent;

/// Orchestrator settings taken from the `system` config section
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub flow_capacity: usize,
    pub request_timeout: Duration,
    pub persistence_queue: usize,
    pub persist_results: bool,
    /// Longest wait for queued persistence jobs on shutdown
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&SystemConfig::default())
    }
}

impl From<&SystemConfig> for OrchestratorOptions {
    fn from(config: &SystemConfig) -> Self {
        Self {
            flow_capacity: config.flow_capacity,
            request_timeout: config.request_timeout(),
            persistence_queue: config.persistence_queue,
            persist_results: config.persist_results,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Result of the last [`Orchestrator::initialize`] run
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub initialized: bool,
    /// Some, but not all, enabled layers failed to initialize
    pub degraded: bool,
    pub memory_available: bool,
    pub layers: Vec<InitOutcome>,
}
