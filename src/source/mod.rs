/// Event sources feeding the pipeline
///
/// An event source delivers failure events at least once and only forgets an
/// event once its offset has been committed.
pub mod jsonl;
pub mod memory;

pub use jsonl::JsonLinesSource;
pub use memory::ChannelSource;

use crate::error::SourceError;
use crate::events::{FailureEvent, Offset};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Called with a reason whenever the source loses its connection
pub type DisconnectCallback = Box<dyn Fn(&str) + Send + Sync>;

/// At-least-once supplier of failure events with commit-on-demand
pub trait EventSource: Send {
    /// Wait up to `timeout` for the next batch; an empty batch is not an error
    fn poll<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FailureEvent>, SourceError>> + Send + 'a>>;

    /// Acknowledge everything up to and including `offset` in its partition
    fn commit<'a>(
        &'a mut self,
        offset: Offset,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + 'a>>;

    fn on_disconnect(&mut self, callback: DisconnectCallback);

    /// True once the source will never yield another event
    fn is_closed(&self) -> bool {
        false
    }
}
