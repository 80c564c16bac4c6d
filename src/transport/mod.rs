//! Network boundary to the other node.

mod http;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ChangeNotice, ProductionRecord};

pub use http::{HttpPeer, API_KEY_HEADER, PEER_HEADER};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
	#[error("peer unreachable: {0}")]
	Unreachable(String),

	#[error("peer timed out after {0:?}")]
	Timeout(Duration),

	#[error("peer rejected the api key")]
	Auth,

	#[error("peer has no such record: {0}")]
	NotFound(String),

	#[error("peer rejected request ({status}): {message}")]
	Rejected { status: u16, message: String },

	#[error("malformed peer response: {0}")]
	Decode(String),

	#[error("invalid peer configuration: {0}")]
	Config(String),
}

impl TransportError {
	/// Whether the same request may succeed later without anyone
	/// changing the payload or the configuration.
	pub fn is_retryable(&self) -> bool {
		match self {
			TransportError::Unreachable(_) | TransportError::Timeout(_) => true,
			TransportError::Rejected { status, .. } => *status >= 500,
			_ => false,
		}
	}

	/// The peer as a whole is unusable, as opposed to refusing one record.
	pub fn is_peer_down(&self) -> bool {
		matches!(
			self,
			TransportError::Unreachable(_) | TransportError::Timeout(_) | TransportError::Auth | TransportError::Config(_)
		)
	}
}

/// The peer's sync endpoints.
///
/// Implementations must raise `Unreachable`/`Timeout` when the peer cannot
/// be reached; an empty snapshot means the peer really holds no records.
#[async_trait]
pub trait PeerTransport: Send + Sync {
	/// `GET /records/export`
	async fn fetch_snapshot(&self) -> Result<Vec<ProductionRecord>, TransportError>;

	/// `POST /records`; returns the record as the peer stored it.
	async fn create(&self, record: &ProductionRecord) -> Result<ProductionRecord, TransportError>;

	/// `PUT /records/{peer_id}`
	async fn update(&self, peer_id: i64, record: &ProductionRecord) -> Result<ProductionRecord, TransportError>;

	/// `POST /sync/apply`; the peer's resulting record, if it kept one.
	async fn apply(&self, change: &ChangeNotice) -> Result<Option<ProductionRecord>, TransportError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_transient_failures_retry() {
		assert!(TransportError::Unreachable("refused".into()).is_retryable());
		assert!(TransportError::Timeout(Duration::from_secs(10)).is_retryable());
		assert!(TransportError::Rejected { status: 503, message: "busy".into() }.is_retryable());
		assert!(!TransportError::Rejected { status: 400, message: "bad".into() }.is_retryable());
		assert!(!TransportError::Auth.is_retryable());
		assert!(!TransportError::NotFound("4".into()).is_retryable());
	}

	#[test]
	fn record_level_failures_do_not_mean_peer_down() {
		assert!(TransportError::Auth.is_peer_down());
		assert!(!TransportError::Rejected { status: 422, message: "bad week".into() }.is_peer_down());
		assert!(!TransportError::Decode("eof".into()).is_peer_down());
	}
}
