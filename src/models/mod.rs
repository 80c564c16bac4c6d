pub mod fields;
pub mod record;
pub mod sync_log;
pub mod wire;

pub use record::{IdentityKey, ProductionRecord, RecordError, RecordFields, RecordStatus, WeekCode};
pub use sync_log::{LogDirection, Severity, SyncAction, SyncDirection, SyncLogEntry, SyncOutcome};
pub use wire::{ChangeAction, ChangeNotice, Envelope, RecordSubmission, SnapshotEnvelope};
