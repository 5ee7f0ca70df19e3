//! Provider registry
//!
//! Name-keyed constructors for the two provider families. Stages never build
//! providers themselves; they receive the instances created here.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};

use super::{
    error::{PipelineError, PipelineResult},
    traits::{LlmProvider, MemorySystem},
};
use crate::config::ProviderConfig;

/// Constructor for an LLM provider
pub type LlmCreateFn = fn(&ProviderConfig) -> PipelineResult<Arc<dyn LlmProvider>>;

/// Constructor for a memory system
pub type MemoryCreateFn = fn(&ProviderConfig) -> PipelineResult<Arc<dyn MemorySystem>>;

/// Registry of provider constructors, keyed by lowercase name
pub struct ProviderRegistry {
    llm: DashMap<String, LlmCreateFn>,
    memory: DashMap<String, MemoryCreateFn>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            llm: DashMap::new(),
            memory: DashMap::new(),
        }
    }

    /// Register an LLM constructor. A later registration under the same
    /// name replaces the earlier one.
    pub fn register_llm(&self, name: &str, create: LlmCreateFn) {
        let key = name.to_ascii_lowercase();
        if self.llm.insert(key, create).is_some() {
            info!("Replacing LLM provider constructor: {name}");
        } else {
            debug!("Registering LLM provider constructor: {name}");
        }
    }

    /// Register a memory constructor with the same replacement rule as
    /// [`Self::register_llm`]
    pub fn register_memory(&self, name: &str, create: MemoryCreateFn) {
        let key = name.to_ascii_lowercase();
        if self.memory.insert(key, create).is_some() {
            info!("Replacing memory system constructor: {name}");
        } else {
            debug!("Registering memory system constructor: {name}");
        }
    }

    /// Build the LLM provider named by `config.provider`
    pub fn create_llm(&self, config: &ProviderConfig) -> PipelineResult<Arc<dyn LlmProvider>> {
        let create = *self
            .llm
            .get(&config.provider.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::UnsupportedProvider(config.provider.clone()))?;
        create(config)
    }

    /// Build the memory system named by `config.provider`
    pub fn create_memory(&self, config: &ProviderConfig) -> PipelineResult<Arc<dyn MemorySystem>> {
        let create = *self
            .memory
            .get(&config.provider.to_ascii_lowercase())
            .ok_or_else(|| PipelineError::UnsupportedProvider(config.provider.clone()))?;
        create(config)
    }

    pub fn llm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.llm.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn memory_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.memory.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
