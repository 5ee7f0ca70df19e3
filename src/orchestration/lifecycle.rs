//! Orchestrator lifecycle management
//!
//! Start-up runs in phases: providers first, then every layer
//! concurrently, then the persistence worker. Shutdown undoes them in
//! reverse order.

use std::{collections::BTreeMap, sync::Arc};

use log::{error, info, warn};
use serde::Serialize;

use super::{
    flow::InformationFlow, persistence::PersistenceQueue, stats::StatsSnapshot, InitReport,
    Orchestrator,
};
use crate::{
    core::{ModelInfo, Phase, PipelineError, PipelineResult},
    stage::{initialize_all, Stage, StageStatus},
};

/// Snapshot returned by [`Orchestrator::get_system_status`]
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub initialized: bool,
    pub phase: Phase,
    pub degraded: bool,
    pub memory_available: bool,
    pub per_layer_initialized: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<ModelInfo>,
    pub flow_count: usize,
    pub stats: StatsSnapshot,
}

impl Orchestrator {
    /// Initialize providers and layers.
    ///
    /// Fails only when no enabled layer initializes. When some layers fail
    /// the pipeline runs degraded and those layers are skipped per request.
    /// Calling this again after a terminal outcome returns that outcome.
    pub async fn initialize(&self) -> PipelineResult<Arc<InitReport>> {
        let ok = self.lifecycle.run(|| self.start_up()).await;
        let report = self.report.load_full();

        if ok {
            return Ok(report);
        }

        let failed: Vec<&str> = report
            .layers
            .iter()
            .filter(|o| !o.initialized)
            .map(|o| o.name.as_str())
            .collect();
        Err(PipelineError::Initialization(if failed.is_empty() {
            "no enabled layers".to_string()
        } else {
            format!("all layers failed to initialize: {}", failed.join(", "))
        }))
    }

    async fn start_up(&self) -> bool {
        info!("Starting pipeline initialization...");

        // Phase 1: providers
        if let Some(llm) = &self.llm {
            if !llm.initialize().await {
                warn!("LLM provider {} failed to initialize", llm.provider_name());
            }
        }

        let memory = match &self.memory {
            Some(memory) => {
                if memory.initialize().await {
                    Some(memory.clone())
                } else {
                    warn!(
                        "Memory system {} failed to initialize, continuing without memory",
                        memory.system_name()
                    );
                    None
                }
            }
            None => None,
        };

        // Phase 2: layers, concurrently
        let outcomes = initialize_all(&self.layers).await;
        let ready = outcomes.iter().filter(|o| o.initialized).count();
        let initialized = ready > 0;
        let degraded = initialized && ready < outcomes.len();

        // Phase 3: persistence worker
        if initialized && self.options.persist_results {
            if let Some(memory) = &memory {
                let queue = PersistenceQueue::start(memory.clone(), self.options.persistence_queue);
                self.persistence.store(Some(Arc::new(queue)));
            }
        }

        if !initialized {
            error!("Pipeline initialization failed: no layer initialized");
        } else if degraded {
            warn!(
                "Pipeline running degraded: {}/{} layers initialized",
                ready,
                outcomes.len()
            );
        } else {
            info!("Pipeline initialization completed, {} layers ready", ready);
        }

        self.report.store(Arc::new(InitReport {
            initialized,
            degraded,
            memory_available: memory.is_some(),
            layers: outcomes,
        }));
        initialized
    }

    /// Drain persistence, clear the flow log and return the orchestrator and
    /// every stage to the uninitialized state. The next `initialize` reruns
    /// setup everywhere, including stages that failed before.
    pub async fn shutdown(&self) {
        info!("Starting graceful shutdown...");

        if let Some(queue) = self.persistence.swap(None) {
            queue.close(self.options.shutdown_grace).await;
        }
        self.flows.clear();
        self.layers.iter().for_each(Stage::reset);
        self.lifecycle.reset();
        self.report.store(Arc::new(InitReport::default()));

        info!("Graceful shutdown completed");
    }

    pub fn init_report(&self) -> Arc<InitReport> {
        self.report.load_full()
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let report = self.report.load();
        SystemStatus {
            initialized: self.lifecycle.is_completed(),
            phase: self.lifecycle.phase(),
            degraded: report.degraded,
            memory_available: report.memory_available,
            per_layer_initialized: self
                .layers
                .iter()
                .map(|l| (l.name().to_string(), l.phase() == Phase::Completed))
                .collect(),
            llm: self.llm.as_ref().map(|llm| llm.model_info()),
            flow_count: self.flows.len(),
            stats: self.stats.snapshot(),
        }
    }

    /// Oldest-first copy of the information-flow log
    pub fn get_information_flows(&self) -> Vec<InformationFlow> {
        self.flows.snapshot()
    }

    /// Status of one layer and its children, `None` if no layer has that name
    pub fn get_layer_status(&self, name: &str) -> Option<StageStatus> {
        self.layers
            .iter()
            .find(|l| l.name() == name)
            .map(Stage::status)
    }
}
