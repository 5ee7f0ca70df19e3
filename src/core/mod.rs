//! Core abstractions and interfaces for tierflow
//!
//! This module provides the request data model, the stage lifecycle, the
//! provider capability traits and the provider registry that the rest of
//! the crate is built on.

pub mod context;
pub mod error;
pub mod lifecycle;
pub mod parse;
pub mod registry;
pub mod result;
pub mod traits;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use context::{qualified_name, HistoryEntry, HistoryStatus, ProcessingContext};
pub use error::{ErrorContext, PipelineError, PipelineResult};
pub use lifecycle::{Lifecycle, Phase};
pub use parse::{parse_or_fallback, parse_structured, Fallback, ParseError, Parsed};
pub use registry::{LlmCreateFn, MemoryCreateFn, ProviderRegistry};
pub use result::{DataMap, ProcessingResult};
pub use traits::*;
pub use types::*;
