//! Stage tree: layers composed of modules composed of submodules
//!
//! All three levels share the [`Stage`] lifecycle contract and start up
//! through the same [`initialize_all`] fan-out. Domain behavior is supplied
//! by handler traits; the structs in this module only add isolation,
//! bookkeeping and output folding around them.

use std::{any::Any, future::Future, panic::AssertUnwindSafe};

use async_trait::async_trait;
use futures::{future::join_all, FutureExt};
use log::{debug, warn};
use serde::Serialize;

use crate::core::{Phase, PipelineError, PipelineResult, ProcessingResult};

pub mod layer;
pub mod module;
pub mod submodule;

pub use layer::{Layer, LayerHandler};
pub use module::{aggregate_submodules, Module, ModuleHandler};
pub use submodule::{SubModule, SubModuleHandler};

/// Lifecycle contract shared by layers, modules and submodules.
///
/// Request processing is not part of the trait: each level has its own
/// inherent `process`, since a submodule reads the context while modules
/// and layers write their children's outputs into it.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn phase(&self) -> Phase;

    /// Run setup once. Never fails; a failed setup leaves the stage in
    /// [`Phase::Error`] and returns false.
    async fn initialize(&self) -> bool;

    /// Return this stage and its children to [`Phase::Initializing`] so the
    /// next `initialize` runs setup again
    fn reset(&self);

    fn status(&self) -> StageStatus {
        StageStatus {
            name: self.name().to_string(),
            enabled: self.is_enabled(),
            phase: self.phase(),
            children: Vec::new(),
        }
    }
}

/// Per-stage outcome of [`initialize_all`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitOutcome {
    pub name: String,
    pub initialized: bool,
}

/// Snapshot of a stage and its children
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub name: String,
    pub enabled: bool,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StageStatus>,
}

/// Initialize every enabled stage concurrently and collect each outcome.
///
/// Failures are reported per stage and never short-circuit the others.
/// Outcomes keep declaration order.
pub async fn initialize_all<S: Stage>(stages: &[S]) -> Vec<InitOutcome> {
    let enabled: Vec<&S> = stages.iter().filter(|s| s.is_enabled()).collect();

    let outcomes = join_all(enabled.iter().map(|stage| async move {
        InitOutcome {
            name: stage.name().to_string(),
            initialized: stage.initialize().await,
        }
    }))
    .await;

    for outcome in outcomes.iter().filter(|o| !o.initialized) {
        warn!("Stage {} failed to initialize", outcome.name);
    }
    outcomes
}

/// Log the children of `parent` that failed to start. A parent never fails
/// because of its children: a child left in [`Phase::Error`] answers each
/// request with a failing result of its own.
pub(crate) fn log_failed_children(parent: &str, outcomes: &[InitOutcome]) {
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| !o.initialized)
        .map(|o| o.name.as_str())
        .collect();
    if !failed.is_empty() {
        warn!(
            "Stage {parent}: {}/{} children failed to initialize: {}",
            failed.len(),
            outcomes.len(),
            failed.join(", ")
        );
    }
}

/// Run a handler future, turning a panic into a stage error
pub(crate) async fn guarded<F, T>(stage: &str, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!("Stage {stage} panicked: {message}");
            Err(PipelineError::stage(stage, format!("panicked: {message}")))
        }
    }
}

/// Run a handler setup future under [`guarded`] and log the outcome
pub(crate) async fn guarded_setup<F>(stage: &str, fut: F) -> bool
where
    F: Future<Output = PipelineResult<()>>,
{
    match guarded(stage, fut).await {
        Ok(()) => {
            debug!("Stage {stage} setup completed");
            true
        }
        Err(err) => {
            warn!("Stage {stage} setup failed: {err}");
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Child results keyed by child name, in declaration order
#[derive(Debug, Clone, Default)]
pub struct StageResults {
    entries: Vec<(String, ProcessingResult)>,
}

impl StageResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, name: String, result: ProcessingResult) {
        self.entries.push((name, result));
    }

    pub fn get(&self, name: &str) -> Option<&ProcessingResult> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, result)| result)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProcessingResult)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    /// Names of the children that reported failure
    pub fn failed(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(n, _)| n)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for StageResults {
    type Item = (String, ProcessingResult);
    type IntoIter = std::vec::IntoIter<(String, ProcessingResult)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_converts_panic() {
        let result: PipelineResult<()> = guarded("a.b", async { panic!("boom") }).await;
        match result {
            Err(PipelineError::StageProcessing { stage, message }) => {
                assert_eq!(stage, "a.b");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_stage_results_keep_insertion_order() {
        let mut results = StageResults::new();
        results.push("zeta".into(), ProcessingResult::failure("x"));
        results.push("alpha".into(), ProcessingResult::success(Default::default()));

        let names: Vec<&str> = results.names().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(results.failed(), vec!["zeta"]);
        assert!(results.get("alpha").unwrap().is_success());
    }
}
