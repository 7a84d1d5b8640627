/// Notification payloads and delivery
pub mod dispatcher;
pub mod payload;

pub use dispatcher::{BackstageTransport, LogTransport, NotificationDispatcher, NotificationTransport};
pub use payload::{truncate_text, EventMetadata, NotificationBody, NotificationPayload};
