use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use serde_yaml::Value as YamlValue;

use super::StageDeps;
use crate::{
    core::{PipelineResult, ProcessingContext, ProcessingResult},
    stage::SubModuleHandler,
};

pub const KIND: &str = "passthrough";

pub fn create_passthrough_handler(
    _cfg: YamlValue,
    _deps: &StageDeps,
) -> PipelineResult<Arc<dyn SubModuleHandler>> {
    Ok(Arc::new(Passthrough))
}

/// Copies the request identity and query into its output. Useful for
/// checking the wiring of a pipeline without calling any provider.
pub struct Passthrough;

#[async_trait]
impl SubModuleHandler for Passthrough {
    async fn handle(&self, ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
        Ok(ProcessingResult::success_value(json!({
            "query": ctx.query(),
            "user_id": ctx.user_id(),
            "session_id": ctx.session_id(),
        })))
    }
}
