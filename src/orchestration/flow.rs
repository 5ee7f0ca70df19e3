//! Information-flow log
//!
//! Records what the orchestrator hands to each layer and what it gets
//! back. The log is a bounded ring: once full, each new record evicts the
//! oldest one.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Longest payload summary kept per record, in characters
const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowType {
    Input,
    Output,
}

#[derive(Debug, Clone, Serialize)]
pub struct InformationFlow {
    pub from_stage: String,
    pub to_stage: String,
    pub flow_type: FlowType,
    pub timestamp: DateTime<Utc>,
    pub payload_summary: String,
}

impl InformationFlow {
    pub fn new(
        from_stage: impl Into<String>,
        to_stage: impl Into<String>,
        flow_type: FlowType,
        payload: &str,
    ) -> Self {
        Self {
            from_stage: from_stage.into(),
            to_stage: to_stage.into(),
            flow_type,
            timestamp: Utc::now(),
            payload_summary: summarize(payload),
        }
    }
}

/// Cut `payload` to [`SUMMARY_MAX_CHARS`] characters
pub fn summarize(payload: &str) -> String {
    match payload.char_indices().nth(SUMMARY_MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &payload[..cut]),
        None => payload.to_string(),
    }
}

pub struct FlowLog {
    capacity: usize,
    entries: Mutex<VecDeque<InformationFlow>>,
}

impl FlowLog {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, flow: InformationFlow) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(flow);
    }

    /// Oldest-first copy of the current contents
    pub fn snapshot(&self) -> Vec<InformationFlow> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_most_recent_in_order() {
        let log = FlowLog::new(3);
        for i in 0..7 {
            log.record(InformationFlow::new(
                "system",
                format!("layer{i}"),
                FlowType::Input,
                "q",
            ));
        }

        let targets: Vec<String> = log.snapshot().into_iter().map(|f| f.to_stage).collect();
        assert_eq!(targets, vec!["layer4", "layer5", "layer6"]);
        assert_eq!(log.len(), log.capacity());
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "é".repeat(500);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 3);
        assert_eq!(summarize("short"), "short");
    }

    #[test]
    fn test_export_uses_iso_timestamps() {
        let flow = InformationFlow::new("a", "b", FlowType::Output, "x");
        let value = serde_json::to_value(&flow).unwrap();
        assert_eq!(value["flow_type"], "output");
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
