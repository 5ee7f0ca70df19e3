use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use serde_yaml::Value as YamlValue;

use super::{stage_config, StageDeps};
use crate::{
    core::{
        MemoryQuery, MemorySystem, MemoryType, PipelineResult, ProcessingContext,
        ProcessingResult, UserContext,
    },
    stage::SubModuleHandler,
};

pub const KIND: &str = "memory_search";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySearchConfig {
    pub limit: usize,
    pub threshold: f64,
    pub memory_types: Vec<MemoryType>,
}

impl Default for MemorySearchConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.2,
            memory_types: Vec::new(),
        }
    }
}

pub fn create_memory_search_handler(
    cfg: YamlValue,
    deps: &StageDeps,
) -> PipelineResult<Arc<dyn SubModuleHandler>> {
    let config: MemorySearchConfig = stage_config(KIND, cfg)?;
    Ok(Arc::new(MemorySearch {
        config,
        memory: deps.memory.clone(),
    }))
}

/// Retrieves memories related to the query.
///
/// Memory is optional: without a memory system, or when the search fails,
/// the submodule still succeeds with an empty list and `available: false`.
pub struct MemorySearch {
    config: MemorySearchConfig,
    memory: Option<Arc<dyn MemorySystem>>,
}

impl MemorySearch {
    fn unavailable() -> ProcessingResult {
        ProcessingResult::success_value(json!({
            "memories": [],
            "count": 0,
            "available": false,
        }))
    }
}

#[async_trait]
impl SubModuleHandler for MemorySearch {
    async fn handle(&self, ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
        let Some(memory) = &self.memory else {
            return Ok(Self::unavailable());
        };

        let user = UserContext::new(ctx.user_id(), ctx.session_id().map(str::to_string));
        let query = MemoryQuery::new(ctx.query(), user)
            .with_limit(self.config.limit)
            .with_threshold(self.config.threshold)
            .with_types(self.config.memory_types.clone());

        match ctx.bounded(KIND, memory.search_memories(&query)).await {
            Ok(found) => {
                let memories: Vec<Value> = found
                    .memories
                    .iter()
                    .map(|m| Value::String(m.entry.content.clone()))
                    .collect();
                Ok(ProcessingResult::success_value(json!({
                    "count": memories.len(),
                    "memories": memories,
                    "total_count": found.total_count,
                    "available": true,
                })))
            }
            Err(err) => {
                warn!(
                    "Memory search in {} failed, continuing without memories: {}",
                    memory.system_name(),
                    err
                );
                Ok(Self::unavailable())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ProviderConfig,
        core::{DataMap, MemoryEntry, ProviderRegistry},
    };

    #[tokio::test]
    async fn test_without_memory_system() {
        let registry = ProviderRegistry::with_builtins();
        let deps = StageDeps {
            llm: registry.create_llm(&ProviderConfig::new("echo")).unwrap(),
            memory: None,
            llm_timeout: None,
        };
        let handler = create_memory_search_handler(YamlValue::Null, &deps).unwrap();
        let ctx = ProcessingContext::new("u1", "anything", DataMap::new());

        let result = handler.handle(&ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.get("available"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_finds_related_memories() {
        let registry = ProviderRegistry::with_builtins();
        let memory = registry
            .create_memory(&ProviderConfig::new("in_memory"))
            .unwrap();
        assert!(memory.initialize().await);
        let user = UserContext::new("u1", None);
        memory
            .add_memory(MemoryEntry::new(
                "favourite colour is green",
                MemoryType::Semantic,
                user.clone(),
            ))
            .await
            .unwrap();
        memory
            .add_memory(MemoryEntry::new(
                "owns a bicycle",
                MemoryType::Semantic,
                user,
            ))
            .await
            .unwrap();

        let deps = StageDeps {
            llm: registry.create_llm(&ProviderConfig::new("echo")).unwrap(),
            memory: Some(memory),
            llm_timeout: None,
        };
        let handler = create_memory_search_handler(YamlValue::Null, &deps).unwrap();
        let ctx = ProcessingContext::new("u1", "what is my favourite colour", DataMap::new());

        let result = handler.handle(&ctx).await.unwrap();
        assert_eq!(result.get("available"), Some(&json!(true)));
        assert_eq!(
            result.get("memories"),
            Some(&json!(["favourite colour is green"]))
        );
    }
}
