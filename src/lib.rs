//! This crate contains the core logic of the tierflow layered LLM pipeline.
//!
//! It defines the stage hierarchy (layers, modules, submodules), the
//! orchestrator that runs requests through it, configuration, and the
//! provider abstractions the stages call into.

pub mod config;
pub mod core;
pub mod logging;
pub mod orchestration;
pub mod pipeline;
pub mod providers;
pub mod stage;
