//! In-memory stand-in for the remote node.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};

use crate::{
	models::{ChangeAction, ChangeNotice, ProductionRecord, RecordFields},
	store::now_millis,
	transport::{PeerTransport, TransportError},
};

#[derive(Default)]
pub struct FakeState {
	pub records: Vec<ProductionRecord>,
	pub next_id: i64,
	/// Every call fails as unreachable.
	pub down: bool,
	/// This many upcoming snapshot fetches fail as unreachable.
	pub failing_fetches: u32,
	/// Creates and updates for these shots are rejected as malformed.
	pub reject_shots: HashSet<String>,
	/// Applied to the peer's copy right before the next export is served,
	/// standing in for an edit made on the peer mid-pass.
	pub edit_on_export: Option<(i64, RecordFields)>,
	pub fetch_delay: Duration,
	pub fetches: u32,
	pub in_flight: u32,
	pub max_in_flight: u32,
	pub applied: Vec<ChangeNotice>,
}

pub struct FakePeer {
	state: Mutex<FakeState>,
}

impl FakePeer {
	pub fn new() -> Arc<Self> {
		Arc::new(FakePeer { state: Mutex::new(FakeState { next_id: 1000, ..Default::default() }) })
	}

	pub fn with_records(fields: Vec<RecordFields>) -> Arc<Self> {
		let peer = Self::new();
		{
			let mut state = peer.state();
			for f in fields {
				state.insert(f, None);
			}
		}
		peer
	}

	pub fn state(&self) -> MutexGuard<'_, FakeState> {
		self.state.lock()
	}

	fn check_record(state: &FakeState, record: &ProductionRecord) -> Result<(), TransportError> {
		if state.down {
			return Err(TransportError::Unreachable("connection refused".into()));
		}
		if state.reject_shots.contains(&record.fields.shot) {
			return Err(TransportError::Rejected { status: 422, message: format!("malformed shot {}", record.fields.shot) });
		}
		Ok(())
	}
}

impl FakeState {
	fn insert(&mut self, fields: RecordFields, sender_id: Option<i64>) -> ProductionRecord {
		let id = self.next_id;
		self.next_id += 1;
		let now = now_millis();
		let record = ProductionRecord { id, peer_id: sender_id, fields, last_synced_at: Some(now), updated_at: now };
		self.records.push(record.clone());
		record
	}

	pub fn get(&self, id: i64) -> Option<&ProductionRecord> {
		self.records.iter().find(|r| r.id == id)
	}

	pub fn by_shot(&self, shot: &str) -> Option<&ProductionRecord> {
		self.records.iter().find(|r| r.fields.shot == shot)
	}
}

#[async_trait]
impl PeerTransport for FakePeer {
	async fn fetch_snapshot(&self) -> Result<Vec<ProductionRecord>, TransportError> {
		let delay = {
			let mut state = self.state();
			state.fetches += 1;
			if state.down {
				return Err(TransportError::Unreachable("connection refused".into()));
			}
			if state.failing_fetches > 0 {
				state.failing_fetches -= 1;
				return Err(TransportError::Unreachable("connection reset".into()));
			}
			state.in_flight += 1;
			state.max_in_flight = state.max_in_flight.max(state.in_flight);
			state.fetch_delay
		};

		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let mut state = self.state();
		state.in_flight -= 1;
		if let Some((id, fields)) = state.edit_on_export.take() {
			if let Some(record) = state.records.iter_mut().find(|r| r.id == id) {
				record.fields = fields;
				record.updated_at = Utc::now();
			}
		}
		Ok(state.records.clone())
	}

	async fn create(&self, record: &ProductionRecord) -> Result<ProductionRecord, TransportError> {
		let mut state = self.state();
		Self::check_record(&state, record)?;
		if state.records.iter().any(|r| r.key() == record.key()) {
			return Err(TransportError::Rejected { status: 409, message: format!("duplicate {}", record.key()) });
		}
		Ok(state.insert(record.fields.clone(), Some(record.id)))
	}

	async fn update(&self, peer_id: i64, record: &ProductionRecord) -> Result<ProductionRecord, TransportError> {
		let mut state = self.state();
		Self::check_record(&state, record)?;
		let stored = state
			.records
			.iter_mut()
			.find(|r| r.id == peer_id)
			.ok_or_else(|| TransportError::NotFound(peer_id.to_string()))?;
		stored.fields = record.fields.clone();
		stored.peer_id = Some(record.id);
		stored.updated_at = now_millis();
		Ok(stored.clone())
	}

	async fn apply(&self, change: &ChangeNotice) -> Result<Option<ProductionRecord>, TransportError> {
		let mut state = self.state();
		Self::check_record(&state, &change.data)?;
		state.applied.push(change.clone());
		let key = change.data.key();
		let position = state.records.iter().position(|r| r.key() == key);
		match (change.action, position) {
			(ChangeAction::Delete, Some(i)) => {
				state.records.remove(i);
				Ok(None)
			}
			(ChangeAction::Delete, None) => Ok(None),
			(_, Some(i)) => {
				let stored = &mut state.records[i];
				stored.fields = change.data.fields.clone();
				stored.peer_id = Some(change.data.id);
				stored.updated_at = now_millis();
				Ok(Some(stored.clone()))
			}
			(_, None) => Ok(Some(state.insert(change.data.fields.clone(), Some(change.data.id)))),
		}
	}
}
