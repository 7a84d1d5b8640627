use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::events::{FailureEvent, Offset};
use crate::source::{DisconnectCallback, EventSource};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::time::Instant;

/// One record of a replay stream
///
/// ```json
/// {"key": "evt-1", "topic": "review", "partition": 0, "offset": 12,
///  "payload": "raw message text", "headers": {"source": "chat"}}
/// ```
/// Only `payload` is required. A non-string payload is kept as its JSON text.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    partition: Option<i32>,
    #[serde(default)]
    offset: Option<i64>,
    payload: Value,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Event source that replays newline-delimited JSON records
///
/// Reads from any async buffered reader, usually a file or stdin. Records
/// without an offset get their zero-based line number; records without a
/// topic get the first configured topic. Records for topics outside the
/// configured set are skipped. Undecodable lines are logged and skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    topics: HashSet<String>,
    default_topic: String,
    max_batch: usize,
    line_number: i64,
    closed: bool,
    committed: BTreeMap<i32, i64>,
    on_disconnect: Option<DisconnectCallback>,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, config: &SourceConfig) -> Self {
        let default_topic = config
            .topics
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            lines: reader.lines(),
            topics: config.topics.iter().cloned().collect(),
            default_topic,
            max_batch: config.max_batch.max(1),
            line_number: 0,
            closed: false,
            committed: BTreeMap::new(),
            on_disconnect: None,
        }
    }

    /// Highest committed position per partition
    pub fn committed(&self) -> &BTreeMap<i32, i64> {
        &self.committed
    }

    /// Decode one line; `Ok(None)` means the record was filtered out
    fn decode(&self, line: &str, line_number: i64) -> Result<Option<FailureEvent>, SourceError> {
        let record: ReplayRecord = serde_json::from_str(line)
            .map_err(|e| SourceError::Decode(format!("line {}: {}", line_number + 1, e)))?;

        let topic = record
            .topic
            .unwrap_or_else(|| self.default_topic.clone());
        if !self.topics.is_empty() && !self.topics.contains(&topic) {
            debug!("Skipping record for unmonitored topic '{}'", topic);
            return Ok(None);
        }

        let payload = match record.payload {
            Value::String(text) => text.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        let offset = Offset::new(
            record.partition.unwrap_or(0),
            record.offset.unwrap_or(line_number),
        );

        Ok(Some(FailureEvent::new(
            record.key,
            topic,
            payload,
            record.headers,
            offset,
        )))
    }

    fn notify_disconnect(&self, reason: &str) {
        if let Some(callback) = &self.on_disconnect {
            callback(reason);
        }
    }
}

impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn poll<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FailureEvent>, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut batch = Vec::new();
            if self.closed {
                return Ok(batch);
            }

            let deadline = Instant::now() + timeout;
            while batch.len() < self.max_batch {
                let line = match tokio::time::timeout_at(deadline, self.lines.next_line()).await {
                    Err(_) => break,
                    Ok(Ok(Some(line))) => line,
                    Ok(Ok(None)) => {
                        info!("Replay stream finished after {} line(s)", self.line_number);
                        self.closed = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        self.notify_disconnect(&e.to_string());
                        if batch.is_empty() {
                            return Err(SourceError::IoError(e));
                        }
                        warn!("Replay stream read failed: {}", e);
                        break;
                    }
                };

                let line_number = self.line_number;
                self.line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match self.decode(&line, line_number) {
                    Ok(Some(event)) => batch.push(event),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping undecodable record: {}", e),
                }
            }

            Ok(batch)
        })
    }

    fn commit<'a>(
        &'a mut self,
        offset: Offset,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let entry = self.committed.entry(offset.partition).or_insert(offset.position);
            if offset.position < *entry {
                return Err(SourceError::Commit(format!(
                    "offset {} is behind committed position {}",
                    offset, entry
                )));
            }
            *entry = offset.position;
            debug!("Committed offset {}", offset);
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
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::BufReader;

    fn config(topics: &[&str]) -> SourceConfig {
        SourceConfig {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            max_batch: 10,
            ..SourceConfig::default()
        }
    }

    fn source(text: &'static str, topics: &[&str]) -> JsonLinesSource<BufReader<&'static [u8]>> {
        JsonLinesSource::new(BufReader::new(text.as_bytes()), &config(topics))
    }

    #[tokio::test]
    async fn test_decodes_records() {
        let mut source = source(
            concat!(
                r#"{"key": "evt-1", "topic": "review", "partition": 2, "offset": 40, "payload": "hello", "headers": {"source": "chat"}}"#,
                "\n",
                r#"{"payload": {"order": 7}}"#,
                "\n"
            ),
            &["review"],
        );

        let batch = source.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 2);

        assert_eq!(batch[0].key, "evt-1");
        assert_eq!(batch[0].offset, Offset::new(2, 40));
        assert_eq!(batch[0].payload_text(), "hello");
        assert_eq!(batch[0].headers.get("source").map(String::as_str), Some("chat"));

        // Defaults: first topic, partition 0, line number as offset, derived key
        assert_eq!(batch[1].topic, "review");
        assert_eq!(batch[1].offset, Offset::new(0, 1));
        assert_eq!(batch[1].key, "review-0-1");
        assert_eq!(batch[1].payload_text(), r#"{"order":7}"#);

        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_skips_bad_lines_and_other_topics() {
        let mut source = source(
            concat!(
                "not json\n",
                "\n",
                r#"{"topic": "billing", "payload": "x"}"#,
                "\n",
                r#"{"topic": "review", "payload": "y"}"#,
                "\n"
            ),
            &["review"],
        );

        let batch = source.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload_text(), "y");
        assert_eq!(batch[0].offset.position, 3);
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let mut source = JsonLinesSource::new(
            BufReader::new("{\"payload\": \"a\"}\n{\"payload\": \"b\"}\n{\"payload\": \"c\"}\n".as_bytes()),
            &SourceConfig {
                max_batch: 2,
                ..config(&["review"])
            },
        );

        assert_eq!(source.poll(Duration::from_millis(100)).await.unwrap().len(), 2);
        assert!(!source.is_closed());
        assert_eq!(source.poll(Duration::from_millis(100)).await.unwrap().len(), 1);
        assert!(source.is_closed());
        assert!(source.poll(Duration::from_millis(100)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_tracks_positions() {
        let mut source = source("", &["review"]);
        source.commit(Offset::new(0, 3)).await.unwrap();
        source.commit(Offset::new(0, 5)).await.unwrap();
        source.commit(Offset::new(1, 0)).await.unwrap();

        assert_eq!(source.committed().get(&0), Some(&5));
        assert_eq!(source.committed().get(&1), Some(&0));
        assert!(matches!(
            source.commit(Offset::new(0, 4)).await,
            Err(SourceError::Commit(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"key": "evt-9", "payload": "from file"}}"#).unwrap();

        let reader = tokio::fs::File::open(file.path()).await.unwrap();
        let mut source = JsonLinesSource::new(tokio::io::BufReader::new(reader), &config(&[]));

        let batch = source.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "evt-9");
        assert_eq!(batch[0].topic, "unknown");
    }
}
