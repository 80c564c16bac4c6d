use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("week code must be 8 digits (YYYYMMDD): {0}")]
    MalformedWeek(String),

    #[error("week code does not name a Monday: {0}")]
    NotMonday(String),

    #[error("unknown status: {0}")]
    UnknownStatus(String),

    #[error("field must not be empty: {0}")]
    EmptyField(&'static str),
}

/// Review state of a shot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Submitted,
    Approved,
    Revision,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Submitted => "submitted",
            RecordStatus::Approved => "approved",
            RecordStatus::Revision => "revision",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "submitted" => Ok(RecordStatus::Submitted),
            "approved" => Ok(RecordStatus::Approved),
            "revision" => Ok(RecordStatus::Revision),
            other => Err(RecordError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The Monday a record is booked against, rendered as `YYYYMMDD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WeekCode(NaiveDate);

impl WeekCode {
    pub fn parse(code: &str) -> Result<Self, RecordError> {
        let code = code.trim();
        if code.len() != 8 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecordError::MalformedWeek(code.to_string()));
        }
        let date = NaiveDate::parse_from_str(code, "%Y%m%d")
            .map_err(|_| RecordError::MalformedWeek(code.to_string()))?;
        Self::from_date(date)
    }

    pub fn from_date(date: NaiveDate) -> Result<Self, RecordError> {
        if date.weekday() != Weekday::Mon {
            return Err(RecordError::NotMonday(date.format("%Y%m%d").to_string()));
        }
        Ok(WeekCode(date))
    }

    /// Monday of the week containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        let offset = date.weekday().num_days_from_monday() as i64;
        WeekCode(date - Duration::days(offset))
    }

    pub fn current() -> Self {
        Self::containing(Utc::now().date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for WeekCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d"))
    }
}

impl TryFrom<String> for WeekCode {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        WeekCode::parse(&value)
    }
}

impl From<WeekCode> for String {
    fn from(value: WeekCode) -> Self {
        value.to_string()
    }
}

/// Business key: one shot may be booked exactly once across both nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKey {
    pub project_type: String,
    pub title: String,
    pub scene: String,
    pub shot: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.project_type, self.title, self.scene, self.shot)
    }
}

/// The editable part of a record, as submitted by a client or a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFields {
    pub animator: String,
    pub project_type: String,
    pub title: String,
    pub scene: String,
    pub shot: String,
    pub week_code: WeekCode,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RecordFields {
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            project_type: self.project_type.clone(),
            title: self.title.clone(),
            scene: self.scene.clone(),
            shot: self.shot.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        let required = [
            ("animator", &self.animator),
            ("projectType", &self.project_type),
            ("title", &self.title),
            ("scene", &self.scene),
            ("shot", &self.shot),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(RecordError::EmptyField(name));
            }
        }
        Ok(())
    }

    /// Blank notes are stored as absent.
    pub fn normalized(mut self) -> Self {
        self.notes = self.notes.filter(|n| !n.trim().is_empty());
        self
    }
}

/// One production record as held by a node.
///
/// `id` is this node's surrogate id and `peer_id` the id the other node
/// assigned; on the wire the sender's view is serialized, so a receiver
/// reads the sender's `id` as its own `peerId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionRecord {
    pub id: i64,
    #[serde(default)]
    pub peer_id: Option<i64>,
    #[serde(flatten)]
    pub fields: RecordFields,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProductionRecord {
    pub fn key(&self) -> IdentityKey {
        self.fields.key()
    }

    /// Changed locally since the last successful exchange with the peer.
    pub fn is_unsynced(&self) -> bool {
        match self.last_synced_at {
            Some(at) => at < self.updated_at,
            None => true,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_fields(scene: &str, shot: &str) -> RecordFields {
    RecordFields {
        animator: "A".into(),
        project_type: "long-form".into(),
        title: "Ep1".into(),
        scene: scene.into(),
        shot: shot.into(),
        week_code: WeekCode::parse("20250106").unwrap(),
        status: RecordStatus::Submitted,
        notes: None,
    }
}
