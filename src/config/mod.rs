/// Configuration management
pub mod settings;

pub use settings::{
    Config, DedupConfig, HealthConfig, NotificationConfig, NotificationTransportKind,
    PipelineConfig, ReasoningBackendConfig, ReasoningConfig, RetryConfig, ServiceConfig,
    SourceConfig,
};
