//! Request context management
//!
//! This module provides the ProcessingContext that holds per-request state
//! and carries stage outputs from one stage to the next.
//!
//! A context belongs to exactly one request. Output maps are append-only:
//! a stage's qualified key is written once by its parent and never replaced
//! or removed afterwards.

use std::{
    collections::BTreeMap,
    future::Future,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{
    error::{PipelineError, PipelineResult},
    result::{DataMap, ProcessingResult},
};

/// Build the `"parent.child"` key under which a child's output is stored
pub fn qualified_name(parent: &str, child: &str) -> String {
    format!("{parent}.{child}")
}

/// Outcome recorded in the processing history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Completed,
    Failed,
    Skipped,
}

/// One entry of the append-only processing history
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub stage: String,
    pub status: HistoryStatus,
    pub at: DateTime<Utc>,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-request state threaded through every stage
pub struct ProcessingContext {
    request_id: String,
    user_id: String,
    session_id: Option<String>,
    query: String,
    session_context: DataMap,

    layer_outputs: BTreeMap<String, ProcessingResult>,
    module_outputs: BTreeMap<String, ProcessingResult>,
    submodule_outputs: BTreeMap<String, ProcessingResult>,

    created_at: DateTime<Utc>,
    started: Instant,
    deadline: Option<tokio::time::Instant>,
    history: Vec<HistoryEntry>,
}

impl ProcessingContext {
    /// Create a fresh context for one request
    pub fn new(user_id: impl Into<String>, query: impl Into<String>, session_context: DataMap) -> Self {
        let session_id = session_context
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            session_id,
            query: query.into(),
            session_context,
            layer_outputs: BTreeMap::new(),
            module_outputs: BTreeMap::new(),
            submodule_outputs: BTreeMap::new(),
            created_at: Utc::now(),
            started: Instant::now(),
            deadline: None,
            history: Vec::new(),
        }
    }

    /// Bound every provider call made with [`Self::bounded`] by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + timeout);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn session_context(&self) -> &DataMap {
        &self.session_context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    /// Time left before the request deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
    }

    /// Await `fut`, failing with [`PipelineError::Timeout`] once the request
    /// deadline passes.
    pub async fn bounded<F, T>(&self, label: &str, fut: F) -> PipelineResult<T>
    where
        F: Future<Output = PipelineResult<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| PipelineError::Timeout(label.to_string()))?,
            None => fut.await,
        }
    }

    pub fn layer_outputs(&self) -> &BTreeMap<String, ProcessingResult> {
        &self.layer_outputs
    }

    pub fn module_outputs(&self) -> &BTreeMap<String, ProcessingResult> {
        &self.module_outputs
    }

    pub fn submodule_outputs(&self) -> &BTreeMap<String, ProcessingResult> {
        &self.submodule_outputs
    }

    pub fn layer_output(&self, layer: &str) -> Option<&ProcessingResult> {
        self.layer_outputs.get(layer)
    }

    /// Successful submodule outputs whose key starts with `"module."`
    pub fn successful_submodule_outputs<'a>(
        &'a self,
        module: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ProcessingResult)> + 'a {
        successful_children(&self.submodule_outputs, module)
    }

    /// Successful module outputs whose key starts with `"layer."`
    pub fn successful_module_outputs<'a>(
        &'a self,
        layer: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ProcessingResult)> + 'a {
        successful_children(&self.module_outputs, layer)
    }

    pub fn insert_layer_output(&mut self, layer: &str, result: ProcessingResult) -> PipelineResult<()> {
        append_only(&mut self.layer_outputs, layer.to_string(), result)
    }

    pub fn insert_module_output(&mut self, key: String, result: ProcessingResult) -> PipelineResult<()> {
        append_only(&mut self.module_outputs, key, result)
    }

    pub fn insert_submodule_output(
        &mut self,
        key: String,
        result: ProcessingResult,
    ) -> PipelineResult<()> {
        append_only(&mut self.submodule_outputs, key, result)
    }

    pub fn record_history(
        &mut self,
        stage: impl Into<String>,
        status: HistoryStatus,
        elapsed: Duration,
        detail: Option<String>,
    ) {
        self.history.push(HistoryEntry {
            stage: stage.into(),
            status,
            at: Utc::now(),
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            detail,
        });
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }
}

fn append_only(
    map: &mut BTreeMap<String, ProcessingResult>,
    key: String,
    result: ProcessingResult,
) -> PipelineResult<()> {
    if map.contains_key(&key) {
        return Err(PipelineError::OutputConflict(key));
    }
    map.insert(key, result);
    Ok(())
}

fn successful_children<'a>(
    map: &'a BTreeMap<String, ProcessingResult>,
    parent: &'a str,
) -> impl Iterator<Item = (&'a str, &'a ProcessingResult)> + 'a {
    map.iter().filter_map(move |(key, result)| {
        let child = key.strip_prefix(parent)?.strip_prefix('.')?;
        result.is_success().then_some((child, result))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_qualified_name() {
        assert_eq!(qualified_name("perception", "context"), "perception.context");
        assert_eq!(
            qualified_name("perception", "context"),
            qualified_name("perception", "context")
        );
    }

    #[test]
    fn test_outputs_are_append_only() {
        let mut ctx = ProcessingContext::new("u1", "hello", DataMap::new());
        let key = qualified_name("analysis", "intent");

        ctx.insert_submodule_output(key.clone(), ProcessingResult::success_value(json!({"a": 1})))
            .unwrap();
        let err = ctx
            .insert_submodule_output(key.clone(), ProcessingResult::failure("late"))
            .unwrap_err();

        assert!(matches!(err, PipelineError::OutputConflict(_)));
        assert!(ctx.submodule_outputs()[&key].is_success());
    }

    #[test]
    fn test_session_id_from_session_context() {
        let mut session = DataMap::new();
        session.insert("session_id".to_string(), json!("s-42"));
        let ctx = ProcessingContext::new("u1", "q", session);
        assert_eq!(ctx.session_id(), Some("s-42"));
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_successful_children_filter_by_parent() {
        let mut ctx = ProcessingContext::new("u1", "q", DataMap::new());
        ctx.insert_submodule_output("m.a".into(), ProcessingResult::success(DataMap::new()))
            .unwrap();
        ctx.insert_submodule_output("m.b".into(), ProcessingResult::failure("boom"))
            .unwrap();
        ctx.insert_submodule_output("mm.c".into(), ProcessingResult::success(DataMap::new()))
            .unwrap();

        let names: Vec<&str> = ctx.successful_submodule_outputs("m").map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a"]);
    }

    #[tokio::test]
    async fn test_bounded_reports_timeout() {
        let ctx = ProcessingContext::new("u1", "q", DataMap::new())
            .with_timeout(Duration::from_millis(10));

        let result: PipelineResult<()> = ctx
            .bounded("slow.call", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Timeout(label)) if label == "slow.call"));
    }
}
