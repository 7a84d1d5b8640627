/// Error types and the failure taxonomy
pub mod error;

/// Failure events and bus offsets
pub mod events;

/// Event sources feeding the pipeline
pub mod source;

/// Bounded, time-windowed duplicate suppression
pub mod dedup;

/// Retry decisions for failed analyses
pub mod retry;

/// Analysis engine, reasoning backends and agent tools
pub mod ai;

/// Notification payloads and delivery
pub mod alerts;

/// Coordinator tying the stages together
pub mod pipeline;

/// Health tracking and reporting
pub mod monitoring;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use error::{AnalysisError, ConfigError, DispatchError, ErrorKind, SourceError, ToolError};
pub use events::{FailureEvent, Offset};
