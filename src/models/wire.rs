use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProductionRecord, RecordFields};

/// `{ success, data?, error? }`: the shape of every peer response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope { success: true, data: Some(data), error: None }
    }

    pub fn empty() -> Self {
        Envelope { success: true, data: None, error: None }
    }
}

/// Response of `GET /records/export`.
///
/// `data` has no default: a body without it is malformed, not empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub success: bool,
    pub data: Vec<ProductionRecord>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

/// Body of `POST /sync/apply`: one change, pushed outside a full pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub action: ChangeAction,
    pub data: ProductionRecord,
}

/// Body of `POST /records` and `PUT /records/{id}`.
///
/// A peer includes its own surrogate `id`. Client requests may echo a
/// record's `id` back; it is ignored unless the request is marked as
/// coming from the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSubmission {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(flatten)]
    pub fields: RecordFields,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_without_data_is_rejected() {
        let body = r#"{"success":true,"count":0,"timestamp":"2025-01-06T00:00:00Z"}"#;
        assert!(serde_json::from_str::<SnapshotEnvelope>(body).is_err());
    }

    #[test]
    fn submission_reads_full_record_body() {
        let body = serde_json::json!({
            "id": 12,
            "peerId": 3,
            "animator": "A",
            "projectType": "long-form",
            "title": "Ep1",
            "scene": "SC_01",
            "shot": "SH_01",
            "weekCode": "20250106",
            "status": "approved",
            "updatedAt": "2025-01-06T10:00:00Z"
        });
        let submission: RecordSubmission = serde_json::from_value(body).unwrap();
        assert_eq!(submission.id, Some(12));
        assert_eq!(submission.fields.shot, "SH_01");
    }

    #[test]
    fn empty_envelope_omits_data_and_error() {
        let json = serde_json::to_value(Envelope::<()>::empty()).unwrap();
        assert_eq!(json, serde_json::json!({"success": true}));
    }
}
