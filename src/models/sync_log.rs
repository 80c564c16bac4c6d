use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side wins a reconciliation pass. Fixed per invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// The peer's snapshot replaces local state.
    Pull,
    /// Unsynced local records are pushed to the peer.
    Push,
    /// Push, then pull.
    #[serde(alias = "both")]
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(SyncDirection::Pull),
            "push" => Ok(SyncDirection::Push),
            "bidirectional" | "both" => Ok(SyncDirection::Bidirectional),
            other => Err(format!("unknown sync direction: {other}")),
        }
    }
}

/// Flow a log entry describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogDirection {
    Pull,
    Push,
    /// A single change received from the peer.
    Inbound,
    /// A single change sent by the notification fan-out.
    Outbound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Insert,
    Update,
    Delete,
    FullReplace,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $name:literal),* $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($name => Some($ty::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

str_enum!(LogDirection { Pull => "pull", Push => "push", Inbound => "inbound", Outbound => "outbound" });
str_enum!(SyncAction { Insert => "insert", Update => "update", Delete => "delete", FullReplace => "full_replace" });
str_enum!(SyncOutcome { Success => "success", Failed => "failed" });
str_enum!(Severity { Info => "info", Warning => "warning", Critical => "critical" });

/// Append-only audit row. Never rewritten once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    /// Assigned by the store on append; zero before that.
    #[serde(default)]
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub direction: LogDirection,
    pub record_ids: Vec<i64>,
    pub action: SyncAction,
    pub outcome: SyncOutcome,
    pub severity: Severity,
    pub error: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl SyncLogEntry {
    pub fn success(direction: LogDirection, action: SyncAction, record_ids: Vec<i64>) -> Self {
        SyncLogEntry {
            seq: 0,
            at: Utc::now(),
            direction,
            record_ids,
            action,
            outcome: SyncOutcome::Success,
            severity: Severity::Info,
            error: None,
            payload: None,
        }
    }

    pub fn failure(
        direction: LogDirection,
        action: SyncAction,
        record_ids: Vec<i64>,
        error: impl fmt::Display,
    ) -> Self {
        SyncLogEntry {
            outcome: SyncOutcome::Failed,
            severity: Severity::Warning,
            error: Some(error.to_string()),
            ..Self::success(direction, action, record_ids)
        }
    }

    pub fn with_payload(mut self, payload: impl Serialize) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_strings_match_wire_names() {
        assert_eq!(SyncAction::FullReplace.as_str(), "full_replace");
        assert_eq!(LogDirection::Outbound.as_str(), "outbound");
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(SyncOutcome::parse("nope"), None);
    }

    #[test]
    fn failure_defaults_to_warning() {
        let entry = SyncLogEntry::failure(LogDirection::Push, SyncAction::Insert, vec![3], "boom");
        assert_eq!(entry.outcome, SyncOutcome::Failed);
        assert_eq!(entry.severity, Severity::Warning);
        assert_eq!(entry.error.as_deref(), Some("boom"));
    }

    #[test]
    fn direction_accepts_both_alias() {
        assert_eq!("both".parse::<SyncDirection>().unwrap(), SyncDirection::Bidirectional);
        assert!("sideways".parse::<SyncDirection>().is_err());
    }
}
