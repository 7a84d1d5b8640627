use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use misroute::ai::{
    AnalysisEngine, CatalogGroupsTool, MockBackend, OpenAIBackend, ReasoningBackend, ToolRegistry,
};
use misroute::alerts::{BackstageTransport, LogTransport, NotificationDispatcher, NotificationTransport};
use misroute::config::{Config, NotificationTransportKind, ReasoningBackendConfig};
use misroute::dedup::Deduplicator;
use misroute::error::ConfigError;
use misroute::monitoring::HealthMonitor;
use misroute::pipeline::{PipelineCoordinator, PipelineParts, PipelineSettings, StopReason};
use misroute::retry::RetryPolicy;
use misroute::source::JsonLinesSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::watch;

/// Command-line arguments for the routing-failure analyzer
#[derive(Parser)]
#[command(
    name = "misroute",
    about = "Routing-failure analyzer - diagnoses messages that could not be routed and notifies their owners",
    long_about = "Consumes failure events, asks a reasoning backend why each message could not be \
                  routed, and sends the diagnosis (or a fallback report) to the developer portal. \
                  Events are read as JSON lines from a file or from stdin."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Replay file with one failure event per line
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "JSON-lines event file; reads stdin when omitted"
    )]
    input: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

impl Cli {
    /// Validate the CLI arguments
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        if let Some(ref input) = self.input {
            if !input.is_file() {
                return Err(format!("Input is not a readable file: {}", input.display()));
            }
        }

        Ok(())
    }
}

/// Load configuration from file (if any), then apply environment overrides
///
/// A missing file falls back to defaults; a file that exists but does not
/// parse or validate is fatal.
fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(e)) if !path.exists() => {
                    warn!("Configuration file not found ({}), using defaults", e);
                    Config::default()
                }
                Err(e) => return Err(e),
            }
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn build_tools(config: &Config) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    if config.notification.api_url.is_empty() {
        info!("No portal URL configured, catalog tool disabled");
        return tools;
    }

    match CatalogGroupsTool::new(
        config.notification.api_url.clone(),
        config.notification.token.clone(),
        config.notification.request_timeout(),
    ) {
        Ok(tool) => tools.register(Arc::new(tool)),
        Err(e) => warn!("Catalog tool unavailable: {}", e),
    }
    tools
}

fn build_backend(config: &Config) -> Result<Arc<dyn ReasoningBackend>> {
    let reasoning = &config.reasoning;
    let backend: Arc<dyn ReasoningBackend> = match &reasoning.backend {
        ReasoningBackendConfig::OpenAI { base_url, api_key } => {
            info!("Using inference server at {} (model {})", base_url, reasoning.model);
            let backend = OpenAIBackend::new(
                base_url.clone(),
                api_key.clone(),
                reasoning.model.clone(),
                config.pipeline.analysis_timeout(),
            )
            .context("Failed to create inference client")?
            .with_sampling(reasoning.temperature, reasoning.max_tokens)
            .with_max_iterations(reasoning.max_iterations);
            Arc::new(backend)
        }
        ReasoningBackendConfig::Mock => {
            warn!("Using mock reasoning backend; diagnoses are canned");
            Arc::new(MockBackend::success())
        }
    };
    Ok(backend)
}

fn build_transport(config: &Config) -> Result<Arc<dyn NotificationTransport>> {
    let transport: Arc<dyn NotificationTransport> = match config.notification.transport {
        NotificationTransportKind::Backstage => {
            info!(
                "Sending notifications to {} for {}",
                config.notification.api_url, config.notification.recipient_entity
            );
            Arc::new(
                BackstageTransport::from_config(&config.notification)
                    .context("Failed to create notification client")?,
            )
        }
        NotificationTransportKind::Log => {
            info!("Notifications will only be logged");
            Arc::new(LogTransport::new())
        }
    };
    Ok(transport)
}

fn build_parts(config: &Config, health: Arc<HealthMonitor>) -> Result<PipelineParts> {
    let engine = AnalysisEngine::new(build_backend(config)?, Arc::new(build_tools(config)));
    let dispatcher = NotificationDispatcher::from_config(build_transport(config)?, &config.notification);

    Ok(PipelineParts {
        engine,
        retry: RetryPolicy::from_config(&config.retry),
        dispatcher,
        dedup: Arc::new(Deduplicator::new(config.dedup.window(), config.dedup.capacity)),
        health,
    })
}

/// Periodically log the health snapshot until aborted
fn spawn_health_reporter(health: Arc<HealthMonitor>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            health.report();
        }
    })
}

async fn run_pipeline<R>(reader: R, config: &Config, shutdown: watch::Receiver<bool>) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
{
    let health = Arc::new(HealthMonitor::new(config.health.error_window));
    let parts = build_parts(config, Arc::clone(&health))?;
    let source = JsonLinesSource::new(reader, &config.source);
    let coordinator =
        PipelineCoordinator::new(source, parts, PipelineSettings::from_config(config));

    let reporter = spawn_health_reporter(
        Arc::clone(&health),
        Duration::from_secs(config.health.report_interval_secs.max(1)),
    );

    let summary = coordinator.run(shutdown).await;
    reporter.abort();

    let snapshot = health.report();
    match summary.reason {
        StopReason::SourceClosed => info!("Input exhausted, all events processed"),
        StopReason::Shutdown if summary.abandoned > 0 => warn!(
            "Stopped with {} unfinished event(s); they will be redelivered",
            summary.abandoned
        ),
        StopReason::Shutdown => info!("Stopped on request"),
    }
    info!(
        "Processed {} event(s): {} diagnosed, {} fallback(s), {} duplicate(s)",
        snapshot.events_received, snapshot.diagnoses, snapshot.fallbacks, snapshot.duplicates_skipped
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting routing-failure analyzer");

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        anyhow::bail!(e);
    }

    let config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    info!(
        "Service '{}' monitoring topic(s) {:?}",
        config.service.name, config.source.topics
    );
    debug!(
        "Bus settings: brokers={:?}, group={}, security_protocol={}",
        config.source.brokers, config.source.group_id, config.source.security_protocol
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if shutdown_tx.send(true).is_err() {
            error!("Pipeline already stopped");
        }
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            run_pipeline(BufReader::new(file), &config, shutdown_rx).await?;
        }
        None => {
            info!("Reading events from stdin. Press Ctrl+C to stop.");
            run_pipeline(BufReader::new(tokio::io::stdin()), &config, shutdown_rx).await?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn cli(config: Option<PathBuf>, input: Option<PathBuf>) -> Cli {
        Cli {
            config,
            input,
            verbose: false,
        }
    }

    #[test]
    fn test_cli_validation_with_existing_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[reasoning.backend]\ntype = \"mock\"").unwrap();

        assert!(cli(Some(file.path().to_path_buf()), None).validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_missing_file() {
        // Missing config files are handled by falling back to defaults
        let cli = cli(Some(PathBuf::from("/nonexistent/config.toml")), None);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_cli_validation_with_directory() {
        let dir = TempDir::new().unwrap();
        assert!(cli(Some(dir.path().to_path_buf()), None).validate().is_err());
    }

    #[test]
    fn test_cli_validation_rejects_missing_input() {
        let cli = cli(None, Some(PathBuf::from("/nonexistent/events.jsonl")));
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_cli_validation_no_arguments() {
        assert!(cli(None, None).validate().is_ok());
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.pipeline.max_in_flight, 5);
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pipeline]\nmax_in_flight = \"many\"").unwrap();

        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_build_tools_without_portal() {
        let mut config = Config::default();
        config.notification.api_url = String::new();
        assert!(build_tools(&config).is_empty());

        config.notification.api_url = "http://portal/api".to_string();
        assert_eq!(build_tools(&config).names(), vec!["catalog_groups".to_string()]);
    }

    #[tokio::test]
    async fn test_run_pipeline_over_replay_input() {
        let mut config = Config::default();
        config.reasoning.backend = ReasoningBackendConfig::Mock;
        config.notification.transport = NotificationTransportKind::Log;
        config.source.poll_timeout_ms = 10;

        let input = concat!(
            r#"{"key": "evt-1", "payload": "refund or shipping?"}"#,
            "\n",
            r#"{"key": "evt-1", "payload": "refund or shipping?"}"#,
            "\n"
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        run_pipeline(BufReader::new(input.as_bytes()), &config, shutdown_rx)
            .await
            .unwrap();
    }
}
