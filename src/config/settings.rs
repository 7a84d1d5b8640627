use crate::error::ConfigError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Thirty days
const MAX_DEDUP_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

/// Application configuration
///
/// Built once at startup (file defaults, then environment overrides) and
/// handed by reference to each component constructor. Nothing reads settings
/// from the environment after this point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub source: SourceConfig,
    pub reasoning: ReasoningConfig,
    pub notification: NotificationConfig,
    pub dedup: DedupConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "message-analysis".to_string(),
        }
    }
}

/// Bus connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: Vec<String>,
    /// "earliest" or "latest"
    pub offset_reset: String,
    /// PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL
    pub security_protocol: String,
    pub sasl_mechanism: String,
    pub sasl_username: String,
    pub sasl_password: String,
    pub poll_timeout_ms: u64,
    pub max_batch: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "message-analysis".to_string(),
            topics: vec!["review".to_string()],
            offset_reset: "latest".to_string(),
            security_protocol: "PLAINTEXT".to_string(),
            sasl_mechanism: "SCRAM-SHA-512".to_string(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            poll_timeout_ms: 500,
            max_batch: 64,
        }
    }
}

impl SourceConfig {
    pub fn uses_sasl(&self) -> bool {
        self.security_protocol.starts_with("SASL_")
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Which reasoning backend to talk to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReasoningBackendConfig {
    OpenAI { base_url: String, api_key: String },
    Mock,
}

impl Default for ReasoningBackendConfig {
    fn default() -> Self {
        ReasoningBackendConfig::OpenAI {
            base_url: "http://localhost:8080/v1".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReasoningConfig {
    pub backend: ReasoningBackendConfig,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound on tool-call rounds per analysis
    pub max_iterations: u32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            backend: ReasoningBackendConfig::default(),
            model: "granite-8b-lab-v1".to_string(),
            temperature: 0.3,
            max_tokens: 500,
            max_iterations: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationTransportKind {
    /// Developer-portal notifications API
    Backstage,
    /// Log payloads locally instead of sending them
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub transport: NotificationTransportKind,
    /// Portal API base URL, shared by notifications and the catalog tool
    pub api_url: String,
    pub token: String,
    pub recipient_entity: String,
    pub title: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            transport: NotificationTransportKind::Backstage,
            api_url: "http://localhost:7007/api".to_string(),
            token: String::new(),
            recipient_entity: "user:default/guest".to_string(),
            title: "Message Routing Failure Detected".to_string(),
            max_attempts: 2,
            retry_delay_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

impl NotificationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub window_secs: u64,
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            capacity: 10_000,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_in_flight: usize,
    pub analysis_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            analysis_timeout_secs: 120,
            shutdown_grace_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub report_interval_secs: u64,
    /// Number of recent operations the error rate is computed over
    pub error_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
            error_window: 100,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name).filter(|value| !value.trim().is_empty()).map(|value| {
                debug!("Configuration override from {}", name);
                value
            })
        };

        if let Some(brokers) = var("KAFKA_BROKER") {
            self.source.brokers = split_list(&brokers);
        }
        if let Some(group) = var("CONSUMER_GROUP") {
            self.source.group_id = group;
        }
        if let Some(topics) = var("MONITORED_TOPIC") {
            self.source.topics = split_list(&topics);
        }
        if let Some(reset) = var("KAFKA_AUTO_OFFSET_RESET") {
            self.source.offset_reset = reset;
        }
        if let Some(protocol) = var("KAFKA_SECURITY_PROTOCOL") {
            self.source.security_protocol = protocol;
        }
        if let Some(mechanism) = var("KAFKA_SASL_MECHANISM") {
            self.source.sasl_mechanism = mechanism;
        }
        if let Some(username) = var("KAFKA_SASL_USERNAME") {
            self.source.sasl_username = username;
        }
        if let Some(password) = var("KAFKA_SASL_PASSWORD") {
            self.source.sasl_password = password;
        }

        if let Some(model) = var("AI_MODEL") {
            self.reasoning.model = model;
        }
        if let Some(url) = var("INFERENCE_SERVER_URL") {
            let api_key = match &self.reasoning.backend {
                ReasoningBackendConfig::OpenAI { api_key, .. } => api_key.clone(),
                ReasoningBackendConfig::Mock => String::new(),
            };
            self.reasoning.backend = ReasoningBackendConfig::OpenAI {
                base_url: url,
                api_key,
            };
        }
        if let Some(key) = var("INFERENCE_API_KEY") {
            if let ReasoningBackendConfig::OpenAI { api_key, .. } = &mut self.reasoning.backend {
                *api_key = key;
            }
        }
        if let Some(value) = var("AI_TEMPERATURE") {
            self.reasoning.temperature = parse_var("AI_TEMPERATURE", &value)?;
        }
        if let Some(value) = var("AI_MAX_TOKENS") {
            self.reasoning.max_tokens = parse_var("AI_MAX_TOKENS", &value)?;
        }

        if let Some(url) = var("BACKSTAGE_API_URL") {
            self.notification.api_url = url;
        }
        if let Some(token) = var("BACKSTAGE_TOKEN") {
            self.notification.token = token;
        }
        if let Some(title) = var("NOTIFICATION_TITLE") {
            self.notification.title = title;
        }
        if let Some(entity) = var("NOTIFICATION_RECIPIENT_ENTITY") {
            self.notification.recipient_entity = entity;
        }

        if let Some(value) = var("DEDUP_WINDOW_SECONDS") {
            self.dedup.window_secs = parse_var("DEDUP_WINDOW_SECONDS", &value)?;
        }
        if let Some(value) = var("DEDUP_CAPACITY") {
            self.dedup.capacity = parse_var("DEDUP_CAPACITY", &value)?;
        }
        if let Some(value) = var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_var("RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = var("RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_var("RETRY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = var("MAX_IN_FLIGHT") {
            self.pipeline.max_in_flight = parse_var("MAX_IN_FLIGHT", &value)?;
        }
        if let Some(value) = var("ANALYSIS_TIMEOUT_SECONDS") {
            self.pipeline.analysis_timeout_secs = parse_var("ANALYSIS_TIMEOUT_SECONDS", &value)?;
        }

        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.topics.is_empty() {
            return Err(ConfigError::ValidationError(
                "source.topics must name at least one topic".to_string(),
            ));
        }
        if !matches!(self.source.offset_reset.as_str(), "earliest" | "latest") {
            return Err(ConfigError::ValidationError(format!(
                "source.offset_reset must be 'earliest' or 'latest', got '{}'",
                self.source.offset_reset
            )));
        }
        if !matches!(
            self.source.security_protocol.as_str(),
            "PLAINTEXT" | "SSL" | "SASL_PLAINTEXT" | "SASL_SSL"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "source.security_protocol '{}' is not supported",
                self.source.security_protocol
            )));
        }
        if self.source.uses_sasl()
            && (self.source.sasl_mechanism.is_empty() || self.source.sasl_username.is_empty())
        {
            return Err(ConfigError::ValidationError(format!(
                "source.security_protocol {} needs sasl_mechanism and sasl_username",
                self.source.security_protocol
            )));
        }
        if self.source.max_batch == 0 {
            return Err(ConfigError::ValidationError(
                "source.max_batch must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.reasoning.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "reasoning.temperature must be within [0, 2], got {}",
                self.reasoning.temperature
            )));
        }
        if self.reasoning.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "reasoning.max_iterations must be greater than zero".to_string(),
            ));
        }
        if self.notification.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "notification.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.dedup.window_secs == 0 || self.dedup.window_secs > MAX_DEDUP_WINDOW_SECS {
            return Err(ConfigError::ValidationError(format!(
                "dedup.window_secs must be within 1..={}, got {}",
                MAX_DEDUP_WINDOW_SECS, self.dedup.window_secs
            )));
        }
        if self.dedup.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "dedup.capacity must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
            ));
        }
        if self.pipeline.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_in_flight must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.analysis_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.analysis_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.health.error_window == 0 {
            return Err(ConfigError::ValidationError(
                "health.error_window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::ParseError(format!("environment variable {} has invalid value '{}'", name, value))
    })
}
