//! Unified error handling for tierflow
//!
//! Every fallible operation in the crate returns [`PipelineResult`]. Stage
//! faults are converted into failing `ProcessingResult`s at the stage
//! boundary; only layer failures and start-up failures surface as errors.

use std::fmt;

use super::parse::ParseError;

/// Unified error types for the pipeline
#[derive(Debug)]
pub enum PipelineError {
    /// Configuration-related errors
    Configuration(String),

    /// Start-up failure of a stage or of the whole system
    Initialization(String),

    /// A stage faulted while processing a request
    StageProcessing { stage: String, message: String },

    /// A layer reported failure; the request is aborted
    FatalLayer { layer: String, message: String },

    /// Provider factory lookup miss
    UnsupportedProvider(String),

    /// A provider call failed
    Provider(String),

    /// Deadline exceeded while waiting on a stage or provider
    Timeout(String),

    /// Provider response did not match the expected schema
    Parse(ParseError),

    /// A stage tried to write an output key that already exists
    OutputConflict(String),

    /// Validation errors
    Validation(String),

    /// File and I/O errors
    Io(std::io::Error),

    /// Internal system errors
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable code used in user-visible failure responses
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration_error",
            PipelineError::Initialization(_) => "initialization_error",
            PipelineError::StageProcessing { .. } => "stage_processing_error",
            PipelineError::FatalLayer { .. } => "fatal_layer_error",
            PipelineError::UnsupportedProvider(_) => "unsupported_provider",
            PipelineError::Provider(_) => "provider_error",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Parse(_) => "parse_error",
            PipelineError::OutputConflict(_) => "output_conflict",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Io(_) => "io_error",
            PipelineError::Internal(_) => "internal_error",
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::StageProcessing {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            PipelineError::Initialization(msg) => write!(f, "Initialization failed: {msg}"),
            PipelineError::StageProcessing { stage, message } => {
                write!(f, "Stage {stage} failed: {message}")
            }
            PipelineError::FatalLayer { layer, message } => {
                write!(f, "Layer {layer} failed: {message}")
            }
            PipelineError::UnsupportedProvider(name) => write!(f, "Unsupported provider: {name}"),
            PipelineError::Provider(msg) => write!(f, "Provider error: {msg}"),
            PipelineError::Timeout(msg) => write!(f, "Timed out: {msg}"),
            PipelineError::Parse(err) => write!(f, "Parse error: {err}"),
            PipelineError::OutputConflict(key) => {
                write!(f, "Output key already written: {key}")
            }
            PipelineError::Validation(msg) => write!(f, "Validation error: {msg}"),
            PipelineError::Io(err) => write!(f, "I/O error: {err}"),
            PipelineError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            PipelineError::Parse(err) => Some(err),
            _ => None,
        }
    }
}

// Error conversions
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<ParseError> for PipelineError {
    fn from(err: ParseError) -> Self {
        PipelineError::Parse(err)
    }
}

impl From<validator::ValidationErrors> for PipelineError {
    fn from(err: validator::ValidationErrors) -> Self {
        PipelineError::Validation(err.to_string())
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> PipelineResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::PipelineError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::PipelineError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::PipelineError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::PipelineError::Internal(format!($fmt, $($arg)*))
    };
}
