//! Value types exchanged with LLM and memory providers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::DataMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

/// What a provider reports about itself
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Core,
    Episodic,
    Semantic,
    Procedural,
    Resource,
    Knowledge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    pub memory_type: MemoryType,
    pub user_context: UserContext,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "MemoryEntry::default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: DataMap,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, memory_type: MemoryType, user_context: UserContext) -> Self {
        Self {
            content: content.into(),
            memory_type,
            user_context,
            timestamp: Utc::now(),
            confidence: Self::default_confidence(),
            metadata: DataMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn default_confidence() -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub query: String,
    pub user_context: UserContext,
    #[serde(default)]
    pub memory_types: Vec<MemoryType>,
    #[serde(default = "MemoryQuery::default_limit")]
    pub limit: usize,
    #[serde(default = "MemoryQuery::default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl MemoryQuery {
    pub fn new(query: impl Into<String>, user_context: UserContext) -> Self {
        Self {
            query: query.into(),
            user_context,
            memory_types: Vec::new(),
            limit: Self::default_limit(),
            similarity_threshold: Self::default_similarity_threshold(),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_types(mut self, memory_types: Vec<MemoryType>) -> Self {
        self.memory_types = memory_types;
        self
    }

    fn default_limit() -> usize {
        10
    }

    fn default_similarity_threshold() -> f64 {
        0.7
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMemory {
    pub id: String,
    #[serde(flatten)]
    pub entry: MemoryEntry,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryResult {
    pub memories: Vec<StoredMemory>,
    pub total_count: usize,
    pub query_time_ms: f64,
}
