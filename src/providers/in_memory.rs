use std::{
    cmp::Ordering as CmpOrdering,
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;

use crate::{
    config::ProviderConfig,
    core::{
        MemoryEntry, MemoryQuery, MemoryResult, MemorySystem, PipelineResult, StoredMemory,
    },
};

pub const PROVIDER_NAME: &str = "in_memory";

pub fn create_in_memory_system(_config: &ProviderConfig) -> PipelineResult<Arc<dyn MemorySystem>> {
    Ok(Arc::new(InMemorySystem::new()))
}

/// Process-local memory store keyed by user id.
///
/// Relevance is the share of query tokens found in a memory; an empty
/// query matches everything and ranks by recency. It holds no external
/// resources, so it is usable before `initialize` and initializing keeps
/// what is already stored.
#[derive(Default)]
pub struct InMemorySystem {
    memories: DashMap<String, Vec<StoredMemory>>,
}

impl InMemorySystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.memories.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn score(query: &HashSet<String>, content: &str) -> f64 {
    if query.is_empty() {
        return 1.0;
    }
    let content = tokens(content);
    let hits = query.iter().filter(|t| content.contains(*t)).count();
    hits as f64 / query.len() as f64
}

#[async_trait]
impl MemorySystem for InMemorySystem {
    fn system_name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn initialize(&self) -> bool {
        debug!("In-memory store ready with {} memories", self.len());
        true
    }

    async fn add_memory(&self, entry: MemoryEntry) -> PipelineResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        debug!(
            "Storing {:?} memory {} for user {}",
            entry.memory_type, id, entry.user_context.user_id
        );

        self.memories
            .entry(entry.user_context.user_id.clone())
            .or_default()
            .push(StoredMemory {
                id: id.clone(),
                entry,
                score: 1.0,
            });
        Ok(id)
    }

    async fn search_memories(&self, query: &MemoryQuery) -> PipelineResult<MemoryResult> {
        let started = Instant::now();
        let wanted = tokens(&query.query);

        let mut matches: Vec<StoredMemory> = self
            .memories
            .get(&query.user_context.user_id)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|m| {
                        query.memory_types.is_empty()
                            || query.memory_types.contains(&m.entry.memory_type)
                    })
                    .filter_map(|m| {
                        let score = score(&wanted, &m.entry.content);
                        (score >= query.similarity_threshold).then(|| StoredMemory {
                            score,
                            ..m.clone()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
        });

        let total_count = matches.len();
        matches.truncate(query.limit);

        Ok(MemoryResult {
            memories: matches,
            total_count,
            query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryType, UserContext};

    fn user(id: &str) -> UserContext {
        UserContext::new(id, None)
    }

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let store = InMemorySystem::new();
        store
            .add_memory(MemoryEntry::new("I like green tea", MemoryType::Semantic, user("u1")))
            .await
            .unwrap();
        store
            .add_memory(MemoryEntry::new("Tea time at five", MemoryType::Episodic, user("u1")))
            .await
            .unwrap();
        store
            .add_memory(MemoryEntry::new("green tea for u2", MemoryType::Semantic, user("u2")))
            .await
            .unwrap();

        let query = MemoryQuery::new("green TEA", user("u1")).with_threshold(0.5);
        let result = store.search_memories(&query).await.unwrap();

        assert_eq!(result.total_count, 2);
        assert_eq!(result.memories[0].entry.content, "I like green tea");
        assert!((result.memories[0].score - 1.0).abs() < f64::EPSILON);
        assert!((result.memories[1].score - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_type_filter_and_limit() {
        let store = InMemorySystem::new();
        for i in 0..5 {
            store
                .add_memory(MemoryEntry::new(
                    format!("note {i}"),
                    MemoryType::Episodic,
                    user("u1"),
                ))
                .await
                .unwrap();
        }
        store
            .add_memory(MemoryEntry::new("fact", MemoryType::Core, user("u1")))
            .await
            .unwrap();

        let episodic = store
            .get_user_memories(&user("u1"), 3)
            .await
            .unwrap();
        assert_eq!(episodic.total_count, 6);
        assert_eq!(episodic.memories.len(), 3);

        let core = MemoryQuery::new("", user("u1")).with_types(vec![MemoryType::Core]);
        let result = store.search_memories(&core).await.unwrap();
        assert_eq!(result.memories.len(), 1);
        assert_eq!(store.len(), 6);
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_memories() {
        let store = InMemorySystem::new();
        let result = store
            .search_memories(&MemoryQuery::new("anything", user("ghost")))
            .await
            .unwrap();
        assert!(result.memories.is_empty());
        assert_eq!(result.total_count, 0);
    }

    #[tokio::test]
    async fn test_initialize_keeps_stored_memories() {
        let store = InMemorySystem::new();
        store
            .add_memory(MemoryEntry::new("stored early", MemoryType::Semantic, user("u1")))
            .await
            .unwrap();

        assert!(store.initialize().await);
        assert!(store.initialize().await);
        assert_eq!(store.len(), 1);

        let result = store.get_user_memories(&user("u1"), 10).await.unwrap();
        assert_eq!(result.memories[0].entry.content, "stored early");
    }
}
