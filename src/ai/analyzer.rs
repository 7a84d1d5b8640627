use crate::ai::backends::{ReasoningBackend, ReasoningRequest};
use crate::ai::tools::ToolRegistry;
use crate::error::{AnalysisError, ErrorKind};
use crate::events::FailureEvent;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Longest payload excerpt placed in a prompt
const MAX_PROMPT_PAYLOAD_CHARS: usize = 8_000;

/// Instructions given to the reasoning capability for every event
const SYSTEM_PROMPT: &str = r#"You are an expert system analyst specializing in message routing failure analysis.

Your role is to:
1. Analyze messages that failed to be routed properly
2. Identify the likely cause of the routing failure
3. Suggest a specific action that would resolve it

When analyzing messages, consider these common failure causes:
- Ambiguous intent: the message could fit multiple categories
- Missing context: insufficient information to classify
- Data format issues: malformed or unexpected structure
- New content type: content not covered by existing rules
- Schema validation failures: data doesn't match the expected format

Use the available tools when they help, for example to find the team that owns a kind of message.

Respond with a single JSON object with fields:
- cause (string): one sentence describing the likely cause of the routing failure
- suggested_action (string): what should be done about it
- confidence (number between 0 and 1): how sure you are

Example response:
{
  "cause": "The message mixes a refund request with a shipping complaint, matching two routes",
  "suggested_action": "Add a routing rule for combined refund/shipping messages owned by group:default/support",
  "confidence": 0.7
}"#;

/// Structured explanation of why a message could not be routed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnosis {
    /// One-sentence likely cause
    pub cause: String,
    /// What an operator should do about it
    pub suggested_action: String,
    /// Self-reported confidence, 0.0 to 1.0
    pub confidence: f64,
}

impl Diagnosis {
    /// Normalize a backend answer, rejecting ones that cannot be used
    ///
    /// Confidence is clamped into [0, 1]. A NaN confidence or a blank cause
    /// makes the answer malformed.
    pub fn validated(self) -> Result<Self, AnalysisError> {
        if self.confidence.is_nan() {
            return Err(AnalysisError::InvalidResponse(
                "confidence is not a number".to_string(),
            ));
        }
        let cause = self.cause.trim().to_string();
        if cause.is_empty() {
            return Err(AnalysisError::InvalidResponse("empty cause".to_string()));
        }

        Ok(Self {
            cause,
            suggested_action: self.suggested_action.trim().to_string(),
            confidence: self.confidence.clamp(0.0, 1.0),
        })
    }
}

/// Result of one analysis attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Diagnosed {
        cause: String,
        suggested_action: String,
        confidence: f64,
    },
    Failed {
        reason: ErrorKind,
        detail: String,
    },
}

impl AnalysisOutcome {
    fn failed(reason: ErrorKind, detail: impl Into<String>) -> Self {
        AnalysisOutcome::Failed {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_diagnosed(&self) -> bool {
        matches!(self, AnalysisOutcome::Diagnosed { .. })
    }

    /// Split into the diagnosis or the failure kind and detail
    pub fn into_diagnosis(self) -> Result<Diagnosis, (ErrorKind, String)> {
        match self {
            AnalysisOutcome::Diagnosed {
                cause,
                suggested_action,
                confidence,
            } => Ok(Diagnosis {
                cause,
                suggested_action,
                confidence,
            }),
            AnalysisOutcome::Failed { reason, detail } => Err((reason, detail)),
        }
    }
}

/// Aborts the reasoning task when the caller stops waiting for it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs a single reasoning attempt for a failure event
///
/// The engine builds the prompt, calls the backend under a deadline and maps
/// every failure onto an `ErrorKind`. It never retries; that decision belongs
/// to the caller.
pub struct AnalysisEngine {
    backend: Arc<dyn ReasoningBackend>,
    tools: Arc<ToolRegistry>,
}

impl AnalysisEngine {
    pub fn new(backend: Arc<dyn ReasoningBackend>, tools: Arc<ToolRegistry>) -> Self {
        Self { backend, tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn system_prompt() -> &'static str {
        SYSTEM_PROMPT
    }

    /// Format a failure event into the user prompt
    pub fn format_prompt(&self, event: &FailureEvent) -> String {
        let headers =
            serde_json::to_string_pretty(&event.headers).unwrap_or_else(|_| "{}".to_string());

        format!(
            r#"Analyze this message that failed to be routed properly, and give a one sentence summary of the likely cause of the routing failure.

Message: {}

Metadata: Key={}, Topic={}, Partition={}, Offset={}

Headers: {}"#,
            event.payload_preview(MAX_PROMPT_PAYLOAD_CHARS),
            event.key,
            event.topic,
            event.offset.partition,
            event.offset.position,
            headers
        )
    }

    /// Analyze one event, giving the backend at most `timeout`
    ///
    /// The backend runs on its own task so that a panic inside it surfaces as
    /// `Failed{Unknown}`. The task is aborted when the deadline passes or the
    /// caller is cancelled.
    pub async fn analyze(&self, event: &FailureEvent, timeout: Duration) -> AnalysisOutcome {
        let request = ReasoningRequest {
            event: event.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            prompt: self.format_prompt(event),
            tools: Arc::clone(&self.tools),
        };
        debug!("Prompt for event '{}': {}", event.key, request.prompt);

        let backend = Arc::clone(&self.backend);
        let started = Instant::now();
        let mut task = AbortOnDrop(tokio::spawn(async move { backend.reason(&request).await }));

        let result = match tokio::time::timeout(timeout, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(
                    "Reasoning task for event '{}' did not complete: {}",
                    event.key, join_error
                );
                return AnalysisOutcome::failed(
                    ErrorKind::Unknown,
                    format!("reasoning task failed: {}", join_error),
                );
            }
            Err(_) => {
                warn!(
                    "Analysis of event '{}' timed out after {:?}",
                    event.key, timeout
                );
                return AnalysisOutcome::failed(
                    ErrorKind::Timeout,
                    format!("no answer within {:?}", timeout),
                );
            }
        };

        match result.and_then(Diagnosis::validated) {
            Ok(diagnosis) => {
                info!(
                    "Diagnosed event '{}' in {:?} (confidence {:.2}): {}",
                    event.key,
                    started.elapsed(),
                    diagnosis.confidence,
                    diagnosis.cause
                );
                AnalysisOutcome::Diagnosed {
                    cause: diagnosis.cause,
                    suggested_action: diagnosis.suggested_action,
                    confidence: diagnosis.confidence,
                }
            }
            Err(e) => {
                let kind = e.kind();
                warn!("Analysis of event '{}' failed ({}): {}", event.key, kind, e);
                AnalysisOutcome::failed(kind, e.to_string())
            }
        }
    }
}
