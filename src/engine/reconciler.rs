use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
	models::{
		IdentityKey, LogDirection, ProductionRecord, Severity, SyncAction, SyncDirection, SyncLogEntry,
	},
	store::{now_millis, RecordStore, StoreError},
	transport::{PeerTransport, TransportError},
};

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("{direction} pass: peer transport failed: {source}")]
	Transport {
		direction: SyncDirection,
		#[source]
		source: TransportError,
	},

	#[error("{direction} pass: peer rejected our api key")]
	Auth { direction: SyncDirection },

	#[error("{direction} pass: local store failed: {source}")]
	Store {
		direction: SyncDirection,
		#[source]
		source: StoreError,
	},

	#[error("{direction} pass left {failed} record(s) unpushed", failed = .report.failed_count())]
	PartialBatch { direction: SyncDirection, report: Box<PassReport> },

	#[error("a reconciliation pass is already running")]
	Busy,
}

impl SyncError {
	fn transport(direction: SyncDirection, source: TransportError) -> Self {
		match source {
			TransportError::Auth => SyncError::Auth { direction },
			source => SyncError::Transport { direction, source },
		}
	}

	fn store(direction: SyncDirection) -> impl Fn(StoreError) -> SyncError {
		move |source| SyncError::Store { direction, source }
	}

	/// Only a peer that could not be reached is worth trying again.
	pub fn is_retryable(&self) -> bool {
		match self {
			SyncError::Transport { source, .. } => source.is_retryable(),
			_ => false,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
	pub record_id: i64,
	pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
	pub attempted: usize,
	pub created: usize,
	pub updated: usize,
	pub failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
	pub received: usize,
	pub added: usize,
	pub updated: usize,
	pub removed: usize,
	pub unchanged: usize,
	/// The peer sent nothing and every local record was dropped.
	pub wiped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
	pub direction: SyncDirection,
	pub started_at: DateTime<Utc>,
	pub finished_at: DateTime<Utc>,
	pub push: Option<PushReport>,
	pub pull: Option<PullReport>,
}

impl PassReport {
	pub fn failed_count(&self) -> usize {
		self.push.as_ref().map_or(0, |p| p.failures.len())
	}
}

/// Runs one reconciliation pass against the peer in a given direction.
pub struct Reconciler {
	store: Arc<RecordStore>,
	peer: Arc<dyn PeerTransport>,
}

impl Reconciler {
	pub fn new(store: Arc<RecordStore>, peer: Arc<dyn PeerTransport>) -> Self {
		Reconciler { store, peer }
	}

	pub fn store(&self) -> &Arc<RecordStore> {
		&self.store
	}

	/// Bidirectional passes push first so local edits reach the peer
	/// before its snapshot replaces local state: local wins for changes
	/// made here, the peer wins for everything else.
	///
	/// Pushed records stay pushed if a later step fails.
	pub async fn run(&self, direction: SyncDirection) -> Result<PassReport, SyncError> {
		let started_at = Utc::now();
		let mut report = PassReport { direction, started_at, finished_at: started_at, push: None, pull: None };

		if matches!(direction, SyncDirection::Push | SyncDirection::Bidirectional) {
			report.push = Some(self.push(direction).await?);
		}
		if matches!(direction, SyncDirection::Pull | SyncDirection::Bidirectional) {
			report.pull = Some(self.pull(direction).await?);
		}
		report.finished_at = Utc::now();

		if report.failed_count() > 0 {
			return Err(SyncError::PartialBatch { direction, report: Box::new(report) });
		}
		Ok(report)
	}

	/// Send every unsynced local record to the peer.
	///
	/// A record the peer refuses is logged and skipped; only losing the peer
	/// itself stops the batch.
	async fn push(&self, direction: SyncDirection) -> Result<PushReport, SyncError> {
		let as_of = now_millis();
		let pending = self.store.get_unsynced().await.map_err(SyncError::store(direction))?;
		let mut report = PushReport { attempted: pending.len(), ..Default::default() };

		for record in pending {
			match self.push_one(&record).await {
				Ok((action, remote)) => {
					if record.peer_id != Some(remote.id) {
						self.store.link_peer(record.id, remote.id).await.map_err(SyncError::store(direction))?;
					}
					self.store.mark_synced(&[record.id], as_of).await.map_err(SyncError::store(direction))?;
					match action {
						SyncAction::Insert => report.created += 1,
						_ => report.updated += 1,
					}
					self.log(
						SyncLogEntry::success(LogDirection::Push, action, vec![record.id, remote.id])
							.with_payload(&record),
					)
					.await;
				}
				Err((action, err)) => {
					self.log(
						SyncLogEntry::failure(LogDirection::Push, action, vec![record.id], &err).with_payload(&record),
					)
					.await;

					if err.is_peer_down() {
						tracing::warn!(id = record.id, error = %err, "push aborted, peer unavailable");
						return Err(SyncError::transport(direction, err));
					}

					tracing::warn!(id = record.id, key = %record.key(), error = %err, "peer refused record");
					report.failures.push(RecordFailure { record_id: record.id, error: err.to_string() });
				}
			}
		}

		tracing::info!(
			attempted = report.attempted,
			created = report.created,
			updated = report.updated,
			failed = report.failures.len(),
			"push complete"
		);
		Ok(report)
	}

	async fn push_one(
		&self,
		record: &ProductionRecord,
	) -> Result<(SyncAction, ProductionRecord), (SyncAction, TransportError)> {
		let Some(peer_id) = record.peer_id else {
			return self.peer.create(record).await.map(|r| (SyncAction::Insert, r)).map_err(|e| (SyncAction::Insert, e));
		};

		match self.peer.update(peer_id, record).await {
			Ok(remote) => Ok((SyncAction::Update, remote)),
			Err(TransportError::NotFound(_)) => {
				tracing::debug!(id = record.id, peer_id, "peer lost linked record, recreating");
				self.peer.create(record).await.map(|r| (SyncAction::Insert, r)).map_err(|e| (SyncAction::Insert, e))
			}
			Err(e) => Err((SyncAction::Update, e)),
		}
	}

	/// Replace local state with the peer's snapshot.
	async fn pull(&self, direction: SyncDirection) -> Result<PullReport, SyncError> {
		let snapshot = match self.peer.fetch_snapshot().await {
			Ok(snapshot) => snapshot,
			Err(err) => {
				self.log(SyncLogEntry::failure(LogDirection::Pull, SyncAction::FullReplace, vec![], &err)).await;
				return Err(SyncError::transport(direction, err));
			}
		};

		let local = self.store.get_all().await.map_err(SyncError::store(direction))?;
		let matches = match_snapshot(&local, &snapshot);
		let needed = matches.iter().filter(|m| m.is_none()).count();
		let fresh = self.store.allocate_ids(needed).await.map_err(SyncError::store(direction))?;
		let (records, report) = plan_replacement(&local, snapshot, &matches, fresh, now_millis());

		if let Err(err) = self.store.replace_all(records).await {
			self.log(
				SyncLogEntry::failure(LogDirection::Pull, SyncAction::FullReplace, vec![], &err).with_payload(&report),
			)
			.await;
			return Err(SyncError::Store { direction, source: err });
		}

		let mut entry = SyncLogEntry::success(LogDirection::Pull, SyncAction::FullReplace, vec![]).with_payload(&report);
		if report.wiped {
			tracing::error!(removed = report.removed, "peer snapshot was empty, local records wiped");
			entry = entry.with_severity(Severity::Critical);
		} else {
			tracing::info!(
				received = report.received,
				added = report.added,
				updated = report.updated,
				removed = report.removed,
				"pull complete"
			);
		}
		self.log(entry).await;

		Ok(report)
	}

	/// The audit trail is best-effort: a failed append must not turn a
	/// completed exchange into a failed one.
	async fn log(&self, entry: SyncLogEntry) {
		if let Err(e) = self.store.append_sync_log(entry).await {
			tracing::error!(error = %e, "failed to append sync log");
		}
	}
}

/// For each snapshot record, the local id it replaces, if any.
///
/// The peer's id is the primary key for matching; a local record never
/// linked to the peer is matched by identity key instead. No local record
/// is claimed twice.
fn match_snapshot(local: &[ProductionRecord], snapshot: &[ProductionRecord]) -> Vec<Option<i64>> {
	let by_peer: HashMap<i64, i64> = local.iter().filter_map(|r| r.peer_id.map(|p| (p, r.id))).collect();
	let by_key: HashMap<IdentityKey, i64> = local.iter().map(|r| (r.key(), r.id)).collect();
	let mut claimed = HashSet::new();

	let mut matches: Vec<Option<i64>> =
		snapshot.iter().map(|remote| by_peer.get(&remote.id).copied().filter(|id| claimed.insert(*id))).collect();

	for (remote, slot) in snapshot.iter().zip(matches.iter_mut()) {
		if slot.is_none() {
			*slot = by_key.get(&remote.key()).copied().filter(|id| claimed.insert(*id));
		}
	}
	matches
}

/// Build the complete replacement set and the counts describing it.
fn plan_replacement(
	local: &[ProductionRecord],
	snapshot: Vec<ProductionRecord>,
	matches: &[Option<i64>],
	fresh: Vec<i64>,
	now: DateTime<Utc>,
) -> (Vec<ProductionRecord>, PullReport) {
	let by_id: HashMap<i64, &ProductionRecord> = local.iter().map(|r| (r.id, r)).collect();
	let mut fresh = fresh.into_iter();
	let mut report = PullReport { received: snapshot.len(), ..Default::default() };
	let mut records = Vec::with_capacity(snapshot.len());

	for (remote, matched) in snapshot.into_iter().zip(matches) {
		let remote_updated = truncate_millis(remote.updated_at);
		let existing = matched.and_then(|id| by_id.get(&id).copied());

		let record = match existing {
			Some(current) if current.fields == remote.fields && current.peer_id == Some(remote.id) => {
				report.unchanged += 1;
				let last_synced_at = current.last_synced_at.filter(|t| *t >= current.updated_at).unwrap_or(now);
				ProductionRecord { last_synced_at: Some(last_synced_at), ..current.clone() }
			}
			Some(current) => {
				report.updated += 1;
				ProductionRecord {
					id: current.id,
					peer_id: Some(remote.id),
					fields: remote.fields,
					last_synced_at: Some(now.max(remote_updated)),
					updated_at: remote_updated,
				}
			}
			None => {
				report.added += 1;
				let Some(id) = fresh.next() else {
					// allocation is sized from the same matches, so this is unreachable
					continue;
				};
				ProductionRecord {
					id,
					peer_id: Some(remote.id),
					fields: remote.fields,
					last_synced_at: Some(now.max(remote_updated)),
					updated_at: remote_updated,
				}
			}
		};
		records.push(record);
	}

	let kept = matches.iter().flatten().count();
	report.removed = local.len() - kept;
	report.wiped = report.received == 0 && !local.is_empty();
	(records, report)
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::{
		models::{record::sample_fields, RecordStatus, SyncOutcome},
		store::{memory_store, Origin},
		testing::FakePeer,
	};

	async fn setup(peer: Arc<FakePeer>) -> (Arc<RecordStore>, Reconciler) {
		let store = Arc::new(memory_store().await);
		let reconciler = Reconciler::new(store.clone(), peer);
		(store, reconciler)
	}

	fn shots(records: &[ProductionRecord]) -> Vec<String> {
		let mut shots: Vec<_> = records.iter().map(|r| r.fields.shot.clone()).collect();
		shots.sort();
		shots
	}

	#[tokio::test]
	async fn pull_makes_local_match_peer() {
		let mut remote_one = sample_fields("SC_01", "SH_01");
		remote_one.animator = "B".into();
		let peer = FakePeer::with_records(vec![remote_one, sample_fields("SC_01", "SH_03")]);
		let (store, reconciler) = setup(peer).await;
		let kept = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();
		store.insert(sample_fields("SC_01", "SH_02"), Origin::Local).await.unwrap();

		let report = reconciler.run(SyncDirection::Pull).await.unwrap();
		let pull = report.pull.unwrap();

		assert_eq!((pull.added, pull.updated, pull.removed, pull.unchanged), (1, 1, 1, 0));
		let all = store.get_all().await.unwrap();
		assert_eq!(shots(&all), vec!["SH_01", "SH_03"]);
		let merged = all.iter().find(|r| r.fields.shot == "SH_01").unwrap();
		assert_eq!(merged.id, kept.id);
		assert_eq!(merged.fields.animator, "B");
		assert_eq!(merged.peer_id, Some(1000));
		assert!(all.iter().all(|r| !r.is_unsynced()));
	}

	#[tokio::test]
	async fn pulling_the_same_snapshot_twice_changes_nothing() {
		let peer = FakePeer::with_records(vec![sample_fields("SC_01", "SH_01"), sample_fields("SC_02", "SH_01")]);
		let (store, reconciler) = setup(peer).await;

		reconciler.run(SyncDirection::Pull).await.unwrap();
		let once = store.get_all().await.unwrap();
		let second = reconciler.run(SyncDirection::Pull).await.unwrap().pull.unwrap();
		let twice = store.get_all().await.unwrap();

		assert_eq!(once, twice);
		assert_eq!((second.added, second.updated, second.removed, second.unchanged), (0, 0, 0, 2));
	}

	#[tokio::test]
	async fn empty_peer_snapshot_wipes_local_with_critical_entry() {
		let peer = FakePeer::new();
		let (store, reconciler) = setup(peer).await;
		store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();

		let report = reconciler.run(SyncDirection::Pull).await.unwrap();

		assert!(report.pull.unwrap().wiped);
		assert!(store.get_all().await.unwrap().is_empty());
		let log = store.recent_sync_log(10).await.unwrap();
		assert!(log.iter().any(|e| e.action == SyncAction::FullReplace && e.severity == Severity::Critical));
	}

	#[tokio::test]
	async fn unreachable_peer_leaves_local_untouched() {
		let peer = FakePeer::new();
		peer.state().down = true;
		let (store, reconciler) = setup(peer).await;
		let existing = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();

		let err = reconciler.run(SyncDirection::Pull).await.unwrap_err();

		assert!(err.is_retryable());
		assert_eq!(store.get_all().await.unwrap(), vec![existing]);
		let log = store.recent_sync_log(10).await.unwrap();
		assert_eq!(log.len(), 1);
		assert_eq!(log[0].outcome, SyncOutcome::Failed);
	}

	#[tokio::test]
	async fn push_creates_links_and_marks_synced() {
		let peer = FakePeer::new();
		let (store, reconciler) = setup(peer.clone()).await;
		let a = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();
		store.insert(sample_fields("SC_01", "SH_02"), Origin::Local).await.unwrap();

		let push = reconciler.run(SyncDirection::Push).await.unwrap().push.unwrap();

		assert_eq!((push.attempted, push.created, push.updated), (2, 2, 0));
		assert!(store.get_unsynced().await.unwrap().is_empty());
		let linked = store.get(a.id).await.unwrap();
		let remote_id = peer.state().by_shot("SH_01").unwrap().id;
		assert_eq!(linked.peer_id, Some(remote_id));

		let again = reconciler.run(SyncDirection::Push).await.unwrap().push.unwrap();
		assert_eq!(again.attempted, 0);
	}

	#[tokio::test]
	async fn one_bad_record_does_not_block_the_batch() {
		let peer = FakePeer::new();
		peer.state().reject_shots.insert("SH_03".into());
		let (store, reconciler) = setup(peer.clone()).await;
		let mut bad_id = 0;
		for i in 1..=5 {
			let r = store.insert(sample_fields("SC_01", &format!("SH_0{i}")), Origin::Local).await.unwrap();
			if i == 3 {
				bad_id = r.id;
			}
		}

		let err = reconciler.run(SyncDirection::Push).await.unwrap_err();

		let SyncError::PartialBatch { report, .. } = err else { panic!("expected partial batch") };
		let push = report.push.unwrap();
		assert_eq!(push.created, 4);
		assert_eq!(push.failures.len(), 1);
		assert_eq!(push.failures[0].record_id, bad_id);
		assert_eq!(peer.state().records.len(), 4);

		let unsynced: Vec<_> = store.get_unsynced().await.unwrap().iter().map(|r| r.id).collect();
		assert_eq!(unsynced, vec![bad_id]);

		let failures: Vec<_> = store
			.recent_sync_log(50)
			.await
			.unwrap()
			.into_iter()
			.filter(|e| e.outcome == SyncOutcome::Failed)
			.collect();
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].record_ids, vec![bad_id]);
	}

	#[tokio::test]
	async fn push_stops_when_peer_goes_down() {
		let peer = FakePeer::new();
		peer.state().down = true;
		let (store, reconciler) = setup(peer).await;
		store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();
		store.insert(sample_fields("SC_01", "SH_02"), Origin::Local).await.unwrap();

		let err = reconciler.run(SyncDirection::Push).await.unwrap_err();

		assert!(matches!(err, SyncError::Transport { direction: SyncDirection::Push, .. }));
		assert_eq!(store.get_unsynced().await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn update_for_record_peer_lost_recreates_it() {
		let peer = FakePeer::new();
		let (store, reconciler) = setup(peer.clone()).await;
		let record = store.insert(sample_fields("SC_01", "SH_01"), Origin::Local).await.unwrap();
		store.link_peer(record.id, 4242).await.unwrap();

		let push = reconciler.run(SyncDirection::Push).await.unwrap().push.unwrap();

		assert_eq!(push.created, 1);
		let remote_id = peer.state().by_shot("SH_01").unwrap().id;
		assert_eq!(store.get(record.id).await.unwrap().peer_id, Some(remote_id));
	}

	#[tokio::test]
	async fn bidirectional_lets_concurrent_peer_edit_win() {
		let peer = FakePeer::with_records(vec![sample_fields("SC_01", "SH_01")]);
		let (store, reconciler) = setup(peer.clone()).await;
		reconciler.run(SyncDirection::Pull).await.unwrap();
		let local = store.get_all().await.unwrap().remove(0);
		let remote_id = local.peer_id.unwrap();

		tokio::time::sleep(Duration::from_millis(5)).await;
		let mut ours = local.fields.clone();
		ours.animator = "Local".into();
		store.update(local.id, ours, Origin::Local).await.unwrap();

		let mut theirs = local.fields.clone();
		theirs.animator = "Remote".into();
		theirs.status = RecordStatus::Approved;
		peer.state().edit_on_export = Some((remote_id, theirs.clone()));

		let report = reconciler.run(SyncDirection::Bidirectional).await.unwrap();

		assert_eq!(report.push.unwrap().updated, 1);
		let after = store.get(local.id).await.unwrap();
		assert_eq!(after.fields, theirs);
		assert_eq!(after.peer_id, Some(remote_id));
		assert!(!after.is_unsynced());
	}

	#[tokio::test]
	async fn bidirectional_pushes_local_edit_before_pulling() {
		let peer = FakePeer::with_records(vec![sample_fields("SC_01", "SH_01")]);
		let (store, reconciler) = setup(peer.clone()).await;
		reconciler.run(SyncDirection::Pull).await.unwrap();
		let local = store.get_all().await.unwrap().remove(0);

		tokio::time::sleep(Duration::from_millis(5)).await;
		let mut ours = local.fields.clone();
		ours.status = RecordStatus::Revision;
		store.update(local.id, ours.clone(), Origin::Local).await.unwrap();

		reconciler.run(SyncDirection::Bidirectional).await.unwrap();

		assert_eq!(store.get(local.id).await.unwrap().fields, ours);
		assert_eq!(peer.state().get(local.peer_id.unwrap()).unwrap().fields, ours);
	}

	#[test]
	fn matching_prefers_peer_id_then_key_and_never_claims_twice() {
		let now = now_millis();
		let mk = |id, peer_id, shot: &str| ProductionRecord {
			id,
			peer_id,
			fields: sample_fields("SC_01", shot),
			last_synced_at: None,
			updated_at: now,
		};
		let local = vec![mk(1, Some(500), "SH_01"), mk(2, None, "SH_02")];
		// 500 moved to a new shot; 501 took over SH_01's key; 502 matches local 2 by key
		let snapshot = vec![mk(500, None, "SH_09"), mk(501, None, "SH_01"), mk(502, None, "SH_02")];

		assert_eq!(match_snapshot(&local, &snapshot), vec![Some(1), None, Some(2)]);
	}
}
