use crate::error::SourceError;
use crate::events::{FailureEvent, Offset};
use crate::source::{DisconnectCallback, EventSource};
use log::{debug, info};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Offsets committed through a source, in commit order
pub type CommitLog = Arc<Mutex<Vec<Offset>>>;

/// Event source backed by an in-process channel
///
/// Used to embed the pipeline behind another consumer and in tests. The source
/// closes once every sender has been dropped and the channel is drained.
pub struct ChannelSource {
    receiver: mpsc::Receiver<FailureEvent>,
    max_batch: usize,
    commits: CommitLog,
    closed: bool,
    poll_failures: u32,
    on_disconnect: Option<DisconnectCallback>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    pub fn new(capacity: usize, max_batch: usize) -> (Self, mpsc::Sender<FailureEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let source = Self {
            receiver,
            max_batch: max_batch.max(1),
            commits: Arc::new(Mutex::new(Vec::new())),
            closed: false,
            poll_failures: 0,
            on_disconnect: None,
        };
        (source, sender)
    }

    /// Fail the next `count` polls as if the connection had dropped
    pub fn with_poll_failures(mut self, count: u32) -> Self {
        self.poll_failures = count;
        self
    }

    /// Shared handle to the offsets committed so far
    pub fn commit_log(&self) -> CommitLog {
        Arc::clone(&self.commits)
    }

    fn notify_disconnect(&self, reason: &str) {
        if let Some(callback) = &self.on_disconnect {
            callback(reason);
        }
    }
}

impl EventSource for ChannelSource {
    fn poll<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FailureEvent>, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            if self.poll_failures > 0 {
                self.poll_failures -= 1;
                self.notify_disconnect("simulated connection loss");
                return Err(SourceError::Disconnected(
                    "simulated connection loss".to_string(),
                ));
            }
            if self.closed {
                return Ok(Vec::new());
            }

            let first = match tokio::time::timeout(timeout, self.receiver.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!("Event channel closed");
                    self.closed = true;
                    self.notify_disconnect("channel closed");
                    return Ok(Vec::new());
                }
                Err(_) => return Ok(Vec::new()),
            };

            let mut batch = vec![first];
            while batch.len() < self.max_batch {
                match self.receiver.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }
            debug!("Polled {} event(s) from channel", batch.len());
            Ok(batch)
        })
    }

    fn commit<'a>(
        &'a mut self,
        offset: Offset,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + 'a>> {
        Box::pin(async move {
            self.commits
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(offset);
            Ok(())
        })
    }

    fn on_disconnect(&mut self, callback: DisconnectCallback) {
        self.on_disconnect = Some(callback);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(position: i64) -> FailureEvent {
        FailureEvent::new(
            None,
            "review",
            b"payload".to_vec(),
            BTreeMap::new(),
            Offset::new(0, position),
        )
    }

    #[tokio::test]
    async fn test_poll_batches_up_to_max() {
        let (mut source, sender) = ChannelSource::new(16, 2);
        for position in 0..3 {
            sender.send(event(position)).await.unwrap();
        }

        let batch = source.poll(Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = source.poll(Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "review-0-2");
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let (mut source, _sender) = ChannelSource::new(4, 4);
        let batch = source.poll(Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
        assert!(!source.is_closed());
    }

    #[tokio::test]
    async fn test_closed_channel_closes_source() {
        let (mut source, sender) = ChannelSource::new(4, 4);
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        source.on_disconnect(Box::new(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sender.send(event(0)).await.unwrap();
        drop(sender);

        assert_eq!(source.poll(Duration::from_millis(10)).await.unwrap().len(), 1);
        assert!(source.poll(Duration::from_millis(10)).await.unwrap().is_empty());
        assert!(source.is_closed());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_simulated_poll_failures() {
        let (source, _sender) = ChannelSource::new(4, 4);
        let mut source = source.with_poll_failures(1);

        assert!(matches!(
            source.poll(Duration::from_millis(10)).await,
            Err(SourceError::Disconnected(_))
        ));
        assert!(source.poll(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_commits_are_recorded() {
        let (mut source, _sender) = ChannelSource::new(4, 4);
        let log = source.commit_log();

        source.commit(Offset::new(0, 1)).await.unwrap();
        source.commit(Offset::new(1, 7)).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![Offset::new(0, 1), Offset::new(1, 7)]
        );
    }
}
