//! Core traits for tierflow components
//!
//! The two capability interfaces below are the only way stages reach
//! external backends. Nothing in the stage or orchestration code names a
//! concrete provider.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{
    error::PipelineResult,
    types::{
        ChatMessage, ChatResponse, MemoryEntry, MemoryQuery, MemoryResult, ModelInfo,
        UserContext,
    },
};

/// Stream of text chunks produced by a streaming chat call
pub type ChunkStream = BoxStream<'static, PipelineResult<String>>;

/// Chat-capable language model backend
#[async_trait]
pub trait LlmProvider: Send + Sync + 'static {
    /// Registry name of the provider
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Prepare the backend. Returns false instead of failing.
    async fn initialize(&self) -> bool;

    fn is_initialized(&self) -> bool;

    async fn chat(&self, messages: &[ChatMessage]) -> PipelineResult<ChatResponse>;

    /// Stream the reply chunk by chunk.
    ///
    /// Backends without native streaming get a single chunk holding the
    /// whole `chat` reply.
    fn chat_stream(self: Arc<Self>, messages: Vec<ChatMessage>) -> ChunkStream {
        Box::pin(async_stream::try_stream! {
            let response = self.chat(&messages).await?;
            yield response.content;
        })
    }

    /// Single-prompt convenience wrapper over `chat`
    async fn completion(&self, prompt: &str) -> PipelineResult<String> {
        let response = self.chat(&[ChatMessage::user(prompt)]).await?;
        Ok(response.content)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: self.provider_name().to_string(),
            model: self.model_name().to_string(),
            initialized: self.is_initialized(),
        }
    }
}

/// Long-term memory backend
#[async_trait]
pub trait MemorySystem: Send + Sync + 'static {
    /// Registry name of the memory system
    fn system_name(&self) -> &str;

    /// Prepare the backend. Returns false instead of failing.
    async fn initialize(&self) -> bool;

    /// Store an entry and return its id
    async fn add_memory(&self, entry: MemoryEntry) -> PipelineResult<String>;

    async fn search_memories(&self, query: &MemoryQuery) -> PipelineResult<MemoryResult>;

    /// Most recent memories of one user, regardless of relevance
    async fn get_user_memories(
        &self,
        user_context: &UserContext,
        limit: usize,
    ) -> PipelineResult<MemoryResult> {
        let query = MemoryQuery::new("", user_context.clone())
            .with_limit(limit)
            .with_threshold(0.0);
        self.search_memories(&query).await
    }
}
