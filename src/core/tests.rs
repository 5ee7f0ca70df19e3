//! Tests for the core module
//!
//! Registry behaviour: lookup rules, replacement and the built-in tables.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::*;
use crate::{
    config::ProviderConfig,
    providers::{echo, in_memory},
};

static FIRST_BUILT: AtomicUsize = AtomicUsize::new(0);
static SECOND_BUILT: AtomicUsize = AtomicUsize::new(0);
static COUNTED_BUILT: AtomicUsize = AtomicUsize::new(0);

fn build_first(config: &ProviderConfig) -> PipelineResult<Arc<dyn LlmProvider>> {
    FIRST_BUILT.fetch_add(1, Ordering::SeqCst);
    echo::create_echo_provider(config)
}

fn build_second(config: &ProviderConfig) -> PipelineResult<Arc<dyn LlmProvider>> {
    SECOND_BUILT.fetch_add(1, Ordering::SeqCst);
    echo::create_echo_provider(config)
}

fn build_counted(config: &ProviderConfig) -> PipelineResult<Arc<dyn LlmProvider>> {
    COUNTED_BUILT.fetch_add(1, Ordering::SeqCst);
    echo::create_echo_provider(config)
}

#[test]
fn test_last_registration_wins() {
    let registry = ProviderRegistry::new();
    registry.register_llm("scripted", build_first);
    registry.register_llm("scripted", build_second);

    registry
        .create_llm(&ProviderConfig::new("scripted"))
        .unwrap();

    assert_eq!(FIRST_BUILT.load(Ordering::SeqCst), 0);
    assert_eq!(SECOND_BUILT.load(Ordering::SeqCst), 1);
    assert_eq!(registry.llm_names(), vec!["scripted".to_string()]);
}

#[test]
fn test_lookup_ignores_case() {
    let registry = ProviderRegistry::new();
    registry.register_llm("Echo", echo::create_echo_provider);

    let provider = registry.create_llm(&ProviderConfig::new("ECHO")).unwrap();
    assert_eq!(provider.provider_name(), "echo");
}

#[test]
fn test_unknown_provider_constructs_nothing() {
    let registry = ProviderRegistry::new();
    registry.register_llm("counted", build_counted);

    let err = registry
        .create_llm(&ProviderConfig::new("missing"))
        .err()
        .unwrap();

    assert!(matches!(&err, PipelineError::UnsupportedProvider(name) if name == "missing"));
    assert_eq!(err.error_code(), "unsupported_provider");
    assert_eq!(COUNTED_BUILT.load(Ordering::SeqCst), 0);
    assert!(registry
        .create_memory(&ProviderConfig::new("counted"))
        .is_err());
}

#[test]
fn test_builtins_registered() {
    let registry = ProviderRegistry::with_builtins();
    assert_eq!(registry.llm_names(), vec![echo::PROVIDER_NAME.to_string()]);
    assert_eq!(
        registry.memory_names(),
        vec![in_memory::PROVIDER_NAME.to_string()]
    );

    let provider = registry
        .create_llm(&ProviderConfig::new("echo").with_model("parrot"))
        .unwrap();
    assert_eq!(provider.model_name(), "parrot");
    assert!(!provider.is_initialized());
}

#[tokio::test]
async fn test_builtin_memory_round_trip() {
    let registry = ProviderRegistry::with_builtins();
    let memory = registry
        .create_memory(&ProviderConfig::new("in_memory"))
        .unwrap();
    assert!(memory.initialize().await);

    let user = UserContext::new("u1", None);
    let id = memory
        .add_memory(MemoryEntry::new("likes jazz", MemoryType::Core, user.clone()))
        .await
        .unwrap();

    let found = memory.get_user_memories(&user, 5).await.unwrap();
    assert_eq!(found.total_count, 1);
    assert_eq!(found.memories[0].id, id);
}
