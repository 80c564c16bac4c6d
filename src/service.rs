//! Mutation entry points shared by the HTTP surface and the CLI.
//!
//! Local mutations go to the store, then fan out to the peer and optionally
//! trigger a pass. Writes received from the peer go to the store only.

use std::sync::Arc;

use serde::Serialize;

use crate::{
	engine::{Notifier, Orchestrator, PassReport, Trigger},
	mirror::{self, FlatFileMirror},
	models::{
		ChangeAction, ChangeNotice, LogDirection, ProductionRecord, RecordFields, SyncAction, SyncDirection,
		SyncLogEntry,
	},
	store::{Origin, RecordStore, StoreError},
};

/// Sync result riding along with a mutation response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
	pub succeeded: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub report: Option<PassReport>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
	pub record: ProductionRecord,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub sync: Option<SyncMeta>,
}

pub struct RecordService {
	store: Arc<RecordStore>,
	notifier: Option<Notifier>,
	orchestrator: Option<Arc<Orchestrator>>,
	reconcile_on_mutation: bool,
	mirror: Option<Arc<dyn FlatFileMirror>>,
}

impl RecordService {
	pub fn new(store: Arc<RecordStore>) -> Self {
		RecordService { store, notifier: None, orchestrator: None, reconcile_on_mutation: false, mirror: None }
	}

	pub fn with_notifier(mut self, notifier: Notifier) -> Self {
		self.notifier = Some(notifier);
		self
	}

	pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>, reconcile_on_mutation: bool) -> Self {
		self.orchestrator = Some(orchestrator);
		self.reconcile_on_mutation = reconcile_on_mutation;
		self
	}

	pub fn with_mirror(mut self, mirror: Arc<dyn FlatFileMirror>) -> Self {
		self.mirror = Some(mirror);
		self
	}

	pub fn store(&self) -> &Arc<RecordStore> {
		&self.store
	}

	pub fn orchestrator(&self) -> Option<&Arc<Orchestrator>> {
		self.orchestrator.as_ref()
	}

	pub async fn create(&self, fields: RecordFields) -> Result<MutationOutcome, StoreError> {
		let record = self.store.insert(fields, Origin::Local).await?;
		tracing::info!(id = record.id, key = %record.key(), "record created");
		Ok(self.after_local_mutation(ChangeAction::Create, record).await)
	}

	pub async fn update(&self, id: i64, fields: RecordFields) -> Result<MutationOutcome, StoreError> {
		let record = self.store.update(id, fields, Origin::Local).await?;
		tracing::info!(id, key = %record.key(), "record updated");
		Ok(self.after_local_mutation(ChangeAction::Update, record).await)
	}

	pub async fn delete(&self, id: i64) -> Result<MutationOutcome, StoreError> {
		let record = self.store.delete(id).await?;
		tracing::info!(id, key = %record.key(), "record deleted");
		Ok(self.after_local_mutation(ChangeAction::Delete, record).await)
	}

	/// The store result is final by now; nothing here can fail the mutation.
	///
	/// With an on-mutation pass configured the notification is awaited
	/// first, so a delete reaches the peer before its snapshot is pulled.
	async fn after_local_mutation(&self, action: ChangeAction, record: ProductionRecord) -> MutationOutcome {
		let run_pass = self.reconcile_on_mutation && self.orchestrator.is_some();
		if let Some(notifier) = &self.notifier {
			if run_pass {
				notifier.notify(action, &record).await;
			} else {
				notifier.dispatch(action, record.clone());
			}
		}

		let sync = match (&self.orchestrator, run_pass) {
			(Some(orchestrator), true) => {
				Some(match orchestrator.trigger(Trigger::Mutation, SyncDirection::Bidirectional).await {
					Ok(report) => SyncMeta { succeeded: true, report: Some(report), error: None },
					Err(e) => SyncMeta { succeeded: false, report: None, error: Some(e.to_string()) },
				})
			}
			_ => None,
		};

		// a pass that pulled already regenerated the mirror
		if sync.as_ref().is_none_or(|s| !s.succeeded) {
			self.regenerate_mirror().await;
		}
		MutationOutcome { record, sync }
	}

	/// `POST /records` from the peer.
	pub async fn accept_peer_create(&self, sender_id: i64, fields: RecordFields) -> Result<ProductionRecord, StoreError> {
		let (action, record) = self.upsert_from_peer(ChangeAction::Create, sender_id, fields).await?;
		self.log_inbound(action, &record).await;
		self.regenerate_mirror().await;
		Ok(record)
	}

	/// `PUT /records/{id}` from the peer. The record must be unlinked or
	/// already linked to the sender.
	pub async fn accept_peer_update(
		&self,
		id: i64,
		sender_id: i64,
		fields: RecordFields,
	) -> Result<ProductionRecord, StoreError> {
		let current = self.store.get(id).await?;
		if current.peer_id.is_some_and(|p| p != sender_id) {
			return Err(StoreError::Conflict(current.key()));
		}
		let record = self.store.update(id, fields, Origin::Peer { peer_id: sender_id }).await?;
		self.log_inbound(SyncAction::Update, &record).await;
		self.regenerate_mirror().await;
		Ok(record)
	}

	/// `POST /sync/apply`: one change pushed by the peer's fan-out.
	///
	/// Deletes only touch the record linked to the sender; deleting a record
	/// that is already gone succeeds.
	pub async fn apply_remote(&self, change: ChangeNotice) -> Result<Option<ProductionRecord>, StoreError> {
		let sender_id = change.data.id;
		if change.action == ChangeAction::Delete {
			let Some(linked) = self.store.find_by_peer_id(sender_id).await? else {
				tracing::debug!(sender_id, "peer deleted a record we do not hold");
				return Ok(None);
			};
			let deleted = self.store.delete(linked.id).await?;
			self.log_inbound(SyncAction::Delete, &deleted).await;
			self.regenerate_mirror().await;
			return Ok(None);
		}

		let (action, record) = self.upsert_from_peer(change.action, sender_id, change.data.fields).await?;
		self.log_inbound(action, &record).await;
		self.regenerate_mirror().await;
		Ok(Some(record))
	}

	/// Write a peer record, following the sender's link first so a renamed
	/// key still lands on the same row.
	///
	/// A record found only by identity key is taken over when it is linked
	/// to nothing; an update also leaves it alone while it holds local edits
	/// the peer has not seen. Anything else is a `Conflict`.
	async fn upsert_from_peer(
		&self,
		action: ChangeAction,
		sender_id: i64,
		fields: RecordFields,
	) -> Result<(SyncAction, ProductionRecord), StoreError> {
		let origin = Origin::Peer { peer_id: sender_id };
		let key = fields.key();
		let linked = self.store.find_by_peer_id(sender_id).await?;
		let holder = self.store.find_by_key(&key).await?;

		let target = match (linked, holder) {
			(Some(linked), Some(holder)) if holder.id != linked.id => {
				tracing::warn!(
					sender_id,
					local_id = holder.id,
					key = %holder.key(),
					"peer write collides with another record"
				);
				return Err(StoreError::Conflict(key));
			}
			(Some(linked), _) => Some(linked),
			(None, Some(holder))
				if holder.peer_id.is_none() && (action == ChangeAction::Create || !holder.is_unsynced()) =>
			{
				Some(holder)
			}
			(None, Some(holder)) => {
				tracing::warn!(
					sender_id,
					local_id = holder.id,
					key = %holder.key(),
					"peer write would overwrite a record it does not own"
				);
				return Err(StoreError::Conflict(key));
			}
			(None, None) => None,
		};

		match target {
			Some(found) => Ok((SyncAction::Update, self.store.update(found.id, fields, origin).await?)),
			None => Ok((SyncAction::Insert, self.store.insert(fields, origin).await?)),
		}
	}

	async fn log_inbound(&self, action: SyncAction, record: &ProductionRecord) {
		let ids = [Some(record.id), record.peer_id].into_iter().flatten().collect();
		let entry = SyncLogEntry::success(LogDirection::Inbound, action, ids).with_payload(record);
		if let Err(e) = self.store.append_sync_log(entry).await {
			tracing::error!(error = %e, "failed to append sync log");
		}
	}

	async fn regenerate_mirror(&self) {
		let Some(mirror) = &self.mirror else { return };
		if let Err(e) = mirror::regenerate(&self.store, mirror.as_ref()).await {
			tracing::warn!(error = %e, "mirror regeneration failed");
		}
	}
}
