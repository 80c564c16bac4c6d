pub mod notifier;
pub mod orchestrator;
pub mod reconciler;
pub mod retry;

pub use notifier::Notifier;
pub use orchestrator::{Orchestrator, PassOutcome, PassState, PassSummary, SyncStatus, Trigger};
pub use reconciler::{PassReport, PullReport, PushReport, Reconciler, RecordFailure, SyncError};
pub use retry::RetryPolicy;
