use crate::alerts::payload::NotificationPayload;
use crate::config::NotificationConfig;
use crate::error::DispatchError;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Delivers one notification to its destination
pub trait NotificationTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        payload: &'a NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

/// Developer-portal notifications API
///
/// Posts to `{api_url}/notifications` with a bearer token. The event key is
/// sent both as the notification scope and as an `Idempotency-Key` header so
/// redelivered events do not produce extra notifications on the portal.
pub struct BackstageTransport {
    client: Client,
    api_url: String,
    token: String,
    recipient_entity: String,
}

impl BackstageTransport {
    pub fn new(
        api_url: String,
        token: String,
        recipient_entity: String,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url,
            token,
            recipient_entity,
        })
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self, DispatchError> {
        Self::new(
            config.api_url.clone(),
            config.token.clone(),
            config.recipient_entity.clone(),
            config.request_timeout(),
        )
    }

    fn notifications_url(&self) -> String {
        format!("{}/notifications", self.api_url.trim_end_matches('/'))
    }

    fn request_body(&self, payload: &NotificationPayload) -> serde_json::Value {
        json!({
            "payload": {
                "title": payload.title,
                "description": payload.description(),
                "severity": payload.severity,
                "scope": payload.source_event_key,
            },
            "recipients": {
                "type": "entity",
                "entityRef": self.recipient_entity,
            }
        })
    }
}

impl NotificationTransport for BackstageTransport {
    fn send<'a>(
        &'a self,
        payload: &'a NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let body = self.request_body(payload);
            debug!("Notification body: {}", body);

            let mut request = self
                .client
                .post(self.notifications_url())
                .header("Idempotency-Key", payload.source_event_key.as_str())
                .json(&body);
            if !self.token.is_empty() {
                request = request.bearer_auth(&self.token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| DispatchError::Network(e.to_string()))?;

            let status = response.status().as_u16();
            if matches!(status, 200 | 201 | 202) {
                info!(
                    "Notification for '{}' accepted by {} (status {})",
                    payload.source_event_key, self.recipient_entity, status
                );
                Ok(())
            } else {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                Err(DispatchError::Rejected { status, body })
            }
        })
    }
}

/// Transport that logs notifications and keeps them in memory
///
/// Used for local runs without a portal and by tests. It can be told to fail
/// the first few sends.
#[derive(Default)]
pub struct LogTransport {
    sent: Mutex<Vec<NotificationPayload>>,
    failures_remaining: Mutex<u32>,
    attempts: Mutex<u32>,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a network error
    pub fn failing_first(count: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(count),
            ..Self::default()
        }
    }

    /// Payloads delivered so far
    pub fn sent(&self) -> Vec<NotificationPayload> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of send calls, successful or not
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationTransport for LogTransport {
    fn send<'a>(
        &'a self,
        payload: &'a NotificationPayload,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            *self.attempts.lock().unwrap_or_else(PoisonError::into_inner) += 1;

            {
                let mut remaining = self
                    .failures_remaining
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DispatchError::Network("simulated outage".to_string()));
                }
            }

            info!(
                "[{:?}] {} | {}",
                payload.severity,
                payload.title,
                payload.description().replace('\n', " ")
            );
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(payload.clone());
            Ok(())
        })
    }
}

/// Delivers notifications with a small bounded retry
///
/// Network failures and server-side rejections (5xx, 408, 429) are retried;
/// other rejections are final. Calling `dispatch` twice for the same event is
/// safe because the transport deduplicates on the event key.
pub struct NotificationDispatcher {
    transport: Arc<dyn NotificationTransport>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        transport: Arc<dyn NotificationTransport>,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(transport: Arc<dyn NotificationTransport>, config: &NotificationConfig) -> Self {
        Self::new(transport, config.max_attempts, config.retry_delay())
    }

    fn is_retryable(error: &DispatchError) -> bool {
        match error {
            DispatchError::Network(_) => true,
            DispatchError::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            DispatchError::Exhausted { .. } => false,
        }
    }

    pub async fn dispatch(&self, payload: &NotificationPayload) -> Result<(), DispatchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.send(payload).await {
                Ok(()) => {
                    debug!(
                        "Delivered notification for '{}' on attempt {}",
                        payload.source_event_key, attempt
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.max_attempts && Self::is_retryable(&e) => {
                    warn!(
                        "Notification for '{}' failed on attempt {}/{}: {}; retrying in {:?}",
                        payload.source_event_key, attempt, self.max_attempts, e, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "Giving up on notification for '{}' after {} attempt(s): {}",
                        payload.source_event_key, attempt, e
                    );
                    return Err(DispatchError::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::Diagnosis;
    use crate::events::{FailureEvent, Offset};
    use std::collections::BTreeMap;

    fn create_test_payload() -> NotificationPayload {
        let event = FailureEvent::new(
            Some("evt-1".to_string()),
            "review",
            b"payload".to_vec(),
            BTreeMap::new(),
            Offset::new(0, 3),
        );
        let diagnosis = Diagnosis {
            cause: "Missing context".to_string(),
            suggested_action: "Ask the producer to add a category header".to_string(),
            confidence: 0.6,
        };
        NotificationPayload::diagnosed(&event, &diagnosis, 1, "Message Routing Failure Detected")
    }

    /// Transport that always rejects with the given status
    struct RejectingTransport {
        status: u16,
        calls: Mutex<u32>,
    }

    impl NotificationTransport for RejectingTransport {
        fn send<'a>(
            &'a self,
            _payload: &'a NotificationPayload,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
            Box::pin(async move {
                *self.calls.lock().unwrap() += 1;
                Err(DispatchError::Rejected {
                    status: self.status,
                    body: "nope".to_string(),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let transport = Arc::new(LogTransport::new());
        let dispatcher = NotificationDispatcher::new(transport.clone(), 2, Duration::from_millis(1));

        dispatcher.dispatch(&create_test_payload()).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].source_event_key, "evt-1");
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_retries_transient_failure() {
        let transport = Arc::new(LogTransport::failing_first(1));
        let dispatcher = NotificationDispatcher::new(transport.clone(), 2, Duration::from_millis(1));

        dispatcher.dispatch(&create_test_payload()).await.unwrap();
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_exhausts_budget() {
        let transport = Arc::new(LogTransport::failing_first(5));
        let dispatcher = NotificationDispatcher::new(transport.clone(), 2, Duration::from_millis(1));

        let err = dispatcher.dispatch(&create_test_payload()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Exhausted { attempts: 2, .. }));
        assert_eq!(transport.attempts(), 2);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_client_rejection_is_not_retried() {
        let transport = Arc::new(RejectingTransport {
            status: 400,
            calls: Mutex::new(0),
        });
        let dispatcher = NotificationDispatcher::new(transport.clone(), 3, Duration::from_millis(1));

        let err = dispatcher.dispatch(&create_test_payload()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Exhausted { attempts: 1, .. }));
        assert_eq!(*transport.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_rejection_is_retried() {
        let transport = Arc::new(RejectingTransport {
            status: 503,
            calls: Mutex::new(0),
        });
        let dispatcher = NotificationDispatcher::new(transport.clone(), 3, Duration::from_millis(1));

        assert!(dispatcher.dispatch(&create_test_payload()).await.is_err());
        assert_eq!(*transport.calls.lock().unwrap(), 3);
    }

    #[test]
    fn test_backstage_request_body() {
        let transport = BackstageTransport::new(
            "http://portal/api/".to_string(),
            "secret".to_string(),
            "group:default/routing-team".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        let payload = create_test_payload();
        let body = transport.request_body(&payload);

        assert_eq!(transport.notifications_url(), "http://portal/api/notifications");
        assert_eq!(body["payload"]["title"], "Message Routing Failure Detected");
        assert_eq!(body["payload"]["scope"], "evt-1");
        assert_eq!(body["payload"]["severity"], "normal");
        assert_eq!(body["recipients"]["type"], "entity");
        assert_eq!(body["recipients"]["entityRef"], "group:default/routing-team");
        assert!(body["payload"]["description"]
            .as_str()
            .unwrap()
            .contains("Missing context"));
    }
}
