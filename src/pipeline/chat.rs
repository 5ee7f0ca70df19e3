//! LLM-backed submodules

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_yaml::Value as YamlValue;
use validator::Validate;

use super::{call_llm, context_notes, stage_config, StageDeps};
use crate::{
    core::{
        parse_or_fallback, ChatMessage, Fallback, LlmProvider, PipelineError, PipelineResult,
        ProcessingContext, ProcessingResult,
    },
    stage::SubModuleHandler,
};

pub const CHAT_KIND: &str = "chat";
pub const STRUCTURED_KIND: &str = "structured_chat";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub system_prompt: Option<String>,
    /// Prepend the text gathered by earlier stages to the prompt
    pub include_context: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            include_context: true,
        }
    }
}

/// Build the message list sent to the model for the current request
pub(crate) fn build_messages(
    ctx: &ProcessingContext,
    system_prompt: Option<&str>,
    include_context: bool,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(3);
    if let Some(prompt) = system_prompt {
        messages.push(ChatMessage::system(prompt));
    }
    if include_context {
        let notes = context_notes(ctx);
        if !notes.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Relevant context:\n- {}",
                notes.join("\n- ")
            )));
        }
    }
    messages.push(ChatMessage::user(ctx.query()));
    messages
}

async fn ensure_ready(llm: &dyn LlmProvider) -> PipelineResult<()> {
    if llm.is_initialized() || llm.initialize().await {
        Ok(())
    } else {
        Err(PipelineError::Provider(format!(
            "LLM provider {} is not available",
            llm.provider_name()
        )))
    }
}

pub fn create_chat_handler(
    cfg: YamlValue,
    deps: &StageDeps,
) -> PipelineResult<Arc<dyn SubModuleHandler>> {
    let config: ChatConfig = stage_config(CHAT_KIND, cfg)?;
    Ok(Arc::new(Chat {
        config,
        llm: deps.llm.clone(),
        timeout: deps.llm_timeout,
    }))
}

/// Free-form chat call; its reply becomes the `content` output
pub struct Chat {
    config: ChatConfig,
    llm: Arc<dyn LlmProvider>,
    timeout: Option<Duration>,
}

#[async_trait]
impl SubModuleHandler for Chat {
    async fn setup(&self) -> PipelineResult<()> {
        ensure_ready(self.llm.as_ref()).await
    }

    async fn handle(&self, ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
        let messages = build_messages(
            ctx,
            self.config.system_prompt.as_deref(),
            self.config.include_context,
        );
        let response = call_llm(ctx, self.timeout, CHAT_KIND, self.llm.chat(&messages)).await?;

        Ok(ProcessingResult::success_value(json!({
            "content": response.content,
            "model": response.model,
            "finish_reason": response.finish_reason,
            "usage": response.usage,
        })))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StructuredChatConfig {
    /// Instruction describing the JSON object the model must return
    pub instruction: String,
}

impl Default for StructuredChatConfig {
    fn default() -> Self {
        Self {
            instruction: "Classify the user message. Reply with a JSON object: \
                {\"label\": string, \"confidence\": number between 0 and 1, \
                \"notes\": [string]}"
                .to_string(),
        }
    }
}

/// Typed reading of a structured model reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Assessment {
    #[validate(length(min = 1))]
    pub label: String,
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Fallback for Assessment {
    fn fallback() -> Self {
        Assessment {
            label: "unknown".to_string(),
            confidence: 0.0,
            notes: Vec::new(),
        }
    }
}

pub fn create_structured_chat_handler(
    cfg: YamlValue,
    deps: &StageDeps,
) -> PipelineResult<Arc<dyn SubModuleHandler>> {
    let config: StructuredChatConfig = stage_config(STRUCTURED_KIND, cfg)?;
    Ok(Arc::new(StructuredChat {
        config,
        llm: deps.llm.clone(),
        timeout: deps.llm_timeout,
    }))
}

/// Asks the model for a JSON [`Assessment`]. An unusable reply yields the
/// fallback assessment with `degraded: true`, not a failure.
pub struct StructuredChat {
    config: StructuredChatConfig,
    llm: Arc<dyn LlmProvider>,
    timeout: Option<Duration>,
}

#[async_trait]
impl SubModuleHandler for StructuredChat {
    async fn setup(&self) -> PipelineResult<()> {
        ensure_ready(self.llm.as_ref()).await
    }

    async fn handle(&self, ctx: &ProcessingContext) -> PipelineResult<ProcessingResult> {
        let messages = build_messages(ctx, Some(&self.config.instruction), false);
        let response =
            call_llm(ctx, self.timeout, STRUCTURED_KIND, self.llm.chat(&messages)).await?;

        let parsed = parse_or_fallback::<Assessment>(STRUCTURED_KIND, &response.content);
        let degraded = parsed.is_degraded();
        let mut result = ProcessingResult::success_value(json!({
            "label": parsed.value.label,
            "confidence": parsed.value.confidence,
            "notes": parsed.value.notes,
            "degraded": degraded,
        }));
        if let Some(err) = parsed.error {
            result = result.with_metadata("parse_error", err.to_string());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::{ChatResponse, DataMap, TokenUsage};

    /// Replies with a fixed string regardless of input
    struct Canned(&'static str);

    #[async_trait]
    impl LlmProvider for Canned {
        fn provider_name(&self) -> &str {
            "canned"
        }

        fn model_name(&self) -> &str {
            "canned-1"
        }

        async fn initialize(&self) -> bool {
            true
        }

        fn is_initialized(&self) -> bool {
            true
        }

        async fn chat(&self, _messages: &[ChatMessage]) -> PipelineResult<ChatResponse> {
            Ok(ChatResponse {
                content: self.0.to_string(),
                finish_reason: "stop".to_string(),
                model: "canned-1".to_string(),
                usage: TokenUsage::default(),
                created_at: Utc::now(),
            })
        }
    }

    fn deps(reply: &'static str) -> StageDeps {
        StageDeps {
            llm: Arc::new(Canned(reply)),
            memory: None,
            llm_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_chat_returns_content() {
        let handler = create_chat_handler(YamlValue::Null, &deps("hi there")).unwrap();
        let ctx = ProcessingContext::new("u1", "hello", DataMap::new());

        let result = handler.handle(&ctx).await.unwrap();
        assert_eq!(result.content(), Some("hi there"));
        assert_eq!(result.get("model"), Some(&json!("canned-1")));
    }

    #[tokio::test]
    async fn test_structured_chat_parses_reply() {
        let reply = r#"{"label": "question", "confidence": 0.9, "notes": ["short"]}"#;
        let handler = create_structured_chat_handler(YamlValue::Null, &deps(reply)).unwrap();
        let ctx = ProcessingContext::new("u1", "what time is it?", DataMap::new());

        let result = handler.handle(&ctx).await.unwrap();
        assert_eq!(result.get("label"), Some(&json!("question")));
        assert_eq!(result.get("degraded"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn test_structured_chat_falls_back_on_prose() {
        let handler =
            create_structured_chat_handler(YamlValue::Null, &deps("I think it's a question"))
                .unwrap();
        let ctx = ProcessingContext::new("u1", "what time is it?", DataMap::new());

        let result = handler.handle(&ctx).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.get("label"), Some(&json!("unknown")));
        assert_eq!(result.get("degraded"), Some(&json!(true)));
        assert!(result.metadata().contains_key("parse_error"));
    }

    #[test]
    fn test_build_messages_includes_context() {
        let mut ctx = ProcessingContext::new("u1", "and tomorrow?", DataMap::new());
        ctx.insert_layer_output(
            "perception",
            ProcessingResult::success_value(json!({"content": "user asks about weather"})),
        )
        .unwrap();

        let messages = build_messages(&ctx, Some("be brief"), true);
        assert_eq!(messages.len(), 3);
        assert!(messages[1].content.contains("user asks about weather"));
        assert_eq!(messages[2].content, "and tomorrow?");

        let messages = build_messages(&ctx, None, false);
        assert_eq!(messages.len(), 1);
    }
}
