use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    config::ProviderConfig,
    core::{
        ChatMessage, ChatResponse, ChunkStream, LlmProvider, MessageRole, PipelineError,
        PipelineResult, TokenUsage,
    },
};

pub const PROVIDER_NAME: &str = "echo";

/// Creates an echo provider. It needs no backend and accepts any config.
pub fn create_echo_provider(config: &ProviderConfig) -> PipelineResult<Arc<dyn LlmProvider>> {
    let model = if config.model_name.is_empty() {
        PROVIDER_NAME.to_string()
    } else {
        config.model_name.clone()
    };

    Ok(Arc::new(EchoProvider {
        model,
        max_tokens: config.max_tokens,
        initialized: AtomicBool::new(false),
    }))
}

/// Replies with the last user message, cut to `max_tokens` words.
pub struct EchoProvider {
    model: String,
    max_tokens: Option<u32>,
    initialized: AtomicBool,
}

impl EchoProvider {
    fn reply(&self, messages: &[ChatMessage]) -> PipelineResult<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .ok_or_else(|| PipelineError::Provider("no user message to echo".to_string()))?;

        Ok(match self.max_tokens {
            Some(limit) => last
                .content
                .split_inclusive(' ')
                .take(limit as usize)
                .collect::<String>()
                .trim_end()
                .to_string(),
            None => last.content.clone(),
        })
    }
}

fn count_words(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> bool {
        self.initialized.store(true, Ordering::SeqCst);
        true
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn chat(&self, messages: &[ChatMessage]) -> PipelineResult<ChatResponse> {
        let content = self.reply(messages)?;
        let prompt_tokens = messages.iter().map(|m| count_words(&m.content)).sum();

        Ok(ChatResponse {
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens: count_words(&content),
            },
            content,
            finish_reason: "stop".to_string(),
            model: self.model.clone(),
            created_at: Utc::now(),
        })
    }

    fn chat_stream(self: Arc<Self>, messages: Vec<ChatMessage>) -> ChunkStream {
        Box::pin(async_stream::stream! {
            match self.reply(&messages) {
                Ok(content) => {
                    for word in content.split_inclusive(' ') {
                        yield Ok(word.to_string());
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => {
                    yield Err(e);
                }
            }
        })
    }
}
