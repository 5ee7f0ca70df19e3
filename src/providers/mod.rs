//! Built-in providers
//!
//! Only backend-free providers ship with the crate: they make a pipeline
//! runnable end to end without network access. Wire adapters for hosted
//! models register themselves through [`ProviderRegistry`] the same way.

pub mod echo;
pub mod in_memory;

use once_cell::sync::Lazy;

use crate::core::{LlmCreateFn, MemoryCreateFn, ProviderRegistry};

static BUILTIN_LLM_PROVIDERS: Lazy<Vec<(&'static str, LlmCreateFn)>> = Lazy::new(|| {
    let arr: Vec<(&str, LlmCreateFn)> = vec![(echo::PROVIDER_NAME, echo::create_echo_provider)];
    arr
});

static BUILTIN_MEMORY_SYSTEMS: Lazy<Vec<(&'static str, MemoryCreateFn)>> = Lazy::new(|| {
    let arr: Vec<(&str, MemoryCreateFn)> = vec![(
        in_memory::PROVIDER_NAME,
        in_memory::create_in_memory_system,
    )];
    arr
});

impl ProviderRegistry {
    /// Registry pre-populated with the built-in providers
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (name, create) in BUILTIN_LLM_PROVIDERS.iter() {
            registry.register_llm(name, *create);
        }
        for (name, create) in BUILTIN_MEMORY_SYSTEMS.iter() {
            registry.register_memory(name, *create);
        }
        registry
    }
}
