use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::{
	models::{ChangeAction, ChangeNotice, LogDirection, ProductionRecord, SyncAction, SyncLogEntry},
	store::{now_millis, RecordStore},
	transport::PeerTransport,
};

/// Best-effort push of a single mutated record to the peer.
///
/// Never fails from the caller's point of view: the outcome goes to the
/// sync log and the next reconciliation pass picks up whatever was missed.
#[derive(Clone)]
pub struct Notifier {
	peer: Arc<dyn PeerTransport>,
	store: Arc<RecordStore>,
}

impl Notifier {
	pub fn new(peer: Arc<dyn PeerTransport>, store: Arc<RecordStore>) -> Self {
		Notifier { peer, store }
	}

	/// Fire and forget.
	pub fn dispatch(&self, action: ChangeAction, record: ProductionRecord) -> JoinHandle<bool> {
		let notifier = self.clone();
		tokio::spawn(async move { notifier.notify(action, &record).await })
	}

	/// Send one change and record the outcome. Returns whether the peer took it.
	pub async fn notify(&self, action: ChangeAction, record: &ProductionRecord) -> bool {
		let as_of = now_millis();
		let change = ChangeNotice { action, data: record.clone() };
		let log_action = match action {
			ChangeAction::Create => SyncAction::Insert,
			ChangeAction::Update => SyncAction::Update,
			ChangeAction::Delete => SyncAction::Delete,
		};

		match self.peer.apply(&change).await {
			Ok(remote) => {
				let mut ids = vec![record.id];
				if let Some(remote) = remote.filter(|_| action != ChangeAction::Delete) {
					ids.push(remote.id);
					if let Err(e) = self.settle(record, remote.id, as_of).await {
						tracing::warn!(id = record.id, error = %e, "peer accepted change but local link failed");
					}
				}
				tracing::debug!(id = record.id, action = action.as_str(), "peer notified");
				self.log(SyncLogEntry::success(LogDirection::Outbound, log_action, ids).with_payload(record)).await;
				true
			}
			Err(err) => {
				tracing::warn!(id = record.id, action = action.as_str(), error = %err, "peer notification failed");
				self.log(
					SyncLogEntry::failure(LogDirection::Outbound, log_action, vec![record.id], &err).with_payload(record),
				)
				.await;
				false
			}
		}
	}

	async fn settle(
		&self,
		record: &ProductionRecord,
		peer_id: i64,
		as_of: chrono::DateTime<chrono::Utc>,
	) -> Result<(), crate::store::StoreError> {
		if record.peer_id != Some(peer_id) {
			self.store.link_peer(record.id, peer_id).await?;
		}
		self.store.mark_synced(&[record.id], as_of).await
	}

	async fn log(&self, entry: SyncLogEntry) {
		if let Err(e) = self.store.append_sync_log(entry).await {
			tracing::error!(error = %e, "failed to append sync log");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		models::{record::sample_fields, SyncOutcome},
		store::{memory_store, Origin},
		testing::FakePeer,
	};

	async fn setup() -> (Arc<FakePeer>, Arc<RecordStore>, Notifier) {
		let peer = FakePeer::new();
		let store = Arc::new(memory_store().await);
		let notifier = Notifier::new(peer.clone(), store.clone());
		(peer, store, notifier)
	}

	#[tokio::test]
	async fn create_links_and_marks_synced() {
		let (peer, store, notifier) = setup().await;
		let record = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();

		assert!(notifier.dispatch(ChangeAction::Create, record.clone()).await.unwrap());

		let remote = peer.state().by_shot("SH_01").cloned().unwrap();
		assert_eq!(remote.peer_id, Some(record.id));
		let local = store.get(record.id).await.unwrap();
		assert_eq!(local.peer_id, Some(remote.id));
		assert!(!local.is_unsynced());
	}

	#[tokio::test]
	async fn failure_is_logged_not_raised() {
		let (peer, store, notifier) = setup().await;
		peer.state().down = true;
		let record = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();

		assert!(!notifier.notify(ChangeAction::Update, &record).await);

		let log = store.recent_sync_log(5).await.unwrap();
		assert_eq!(log.len(), 1);
		assert_eq!(log[0].direction, LogDirection::Outbound);
		assert_eq!(log[0].outcome, SyncOutcome::Failed);
		assert!(store.get(record.id).await.unwrap().is_unsynced());
	}

	#[tokio::test]
	async fn delete_of_unknown_record_succeeds() {
		let (peer, store, notifier) = setup().await;
		let record = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();
		let deleted = store.delete(record.id).await.unwrap();

		assert!(notifier.notify(ChangeAction::Delete, &deleted).await);
		assert_eq!(peer.state().applied.len(), 1);
	}
}
