/// Ordered offset commits
pub mod commit;

/// Pull loop, worker pool and shutdown handling
pub mod coordinator;

pub use commit::CommitTracker;
pub use coordinator::{PipelineCoordinator, PipelineParts, PipelineSettings, RunSummary, StopReason};
