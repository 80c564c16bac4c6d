use std::collections::HashSet;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{
	db::DbHandle,
	models::{
		fields::{self, RECORD_FIELDS},
		IdentityKey, LogDirection, ProductionRecord, RecordError, RecordFields, Severity, SyncAction,
		SyncLogEntry, SyncOutcome, WeekCode,
	},
};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("identity key already booked: {0}")]
	Conflict(IdentityKey),

	#[error("record not found: {0}")]
	NotFound(i64),

	#[error("invalid record: {0}")]
	Invalid(#[from] RecordError),

	#[error("duplicate local id in replacement set: {0}")]
	DuplicateId(i64),

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error("database error: {0}")]
	DbError(String),
}

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
	/// An edit made on this node; the record becomes unsynced.
	Local,
	/// A write received from the peer, which already holds this version.
	Peer { peer_id: i64 },
}

/// Canonical in-process home of production records and the sync log.
///
/// Every write to `production_record` holds `gate` exclusively and reads
/// hold it shared, so a reader never sees a half-applied `replace_all`.
pub struct RecordStore {
	db: DbHandle,
	gate: RwLock<()>,
	#[cfg(test)]
	fail_before_swap: AtomicBool,
}

enum Param {
	Text(String),
	Int(i64),
	Ints(Vec<i64>),
}

type Params = Vec<(String, Param)>;

macro_rules! bound_query {
	($db:expr, $sql:expr, $params:expr) => {{
		let mut query = $db.query($sql);
		for (name, param) in $params {
			query = match param {
				Param::Text(v) => query.bind((name, v)),
				Param::Int(v) => query.bind((name, v)),
				Param::Ints(v) => query.bind((name, v)),
			};
		}
		query
	}};
}

impl RecordStore {
	pub fn new(db: DbHandle) -> Self {
		RecordStore {
			db,
			gate: RwLock::new(()),
			#[cfg(test)]
			fail_before_swap: AtomicBool::new(false),
		}
	}

	/// All records, most recently updated first.
	pub async fn get_all(&self) -> Result<Vec<ProductionRecord>, StoreError> {
		let _guard = self.gate.read().await;
		self.load_where("", Vec::new()).await
	}

	pub async fn get(&self, id: i64) -> Result<ProductionRecord, StoreError> {
		let _guard = self.gate.read().await;
		self.lookup_id(id).await?.ok_or(StoreError::NotFound(id))
	}

	pub async fn count(&self) -> Result<usize, StoreError> {
		Ok(self.get_all().await?.len())
	}

	pub async fn find_by_key(&self, key: &IdentityKey) -> Result<Option<ProductionRecord>, StoreError> {
		let _guard = self.gate.read().await;
		self.lookup_key(key).await
	}

	pub async fn find_by_peer_id(&self, peer_id: i64) -> Result<Option<ProductionRecord>, StoreError> {
		let _guard = self.gate.read().await;
		let rows = self
			.load_where("WHERE peer_id = $peer_id", vec![("peer_id".into(), Param::Int(peer_id))])
			.await?;
		Ok(rows.into_iter().next())
	}

	/// Rejects a second booking of the same identity key rather than
	/// merging into it.
	pub async fn insert(&self, fields: RecordFields, origin: Origin) -> Result<ProductionRecord, StoreError> {
		let fields = fields.normalized();
		fields.validate()?;

		let _guard = self.gate.write().await;
		let key = fields.key();
		if self.lookup_key(&key).await?.is_some() {
			return Err(StoreError::Conflict(key));
		}

		let id = self.next_ids("records", 1).await?[0];
		let now = now_millis();
		let (peer_id, last_synced_at) = match origin {
			Origin::Local => (None, None),
			Origin::Peer { peer_id } => (Some(peer_id), Some(now)),
		};
		let record = ProductionRecord { id, peer_id, fields, last_synced_at, updated_at: now };

		let mut params = Params::new();
		let content = record_content(&record, "", &mut params);
		self.exec(format!("CREATE production_record CONTENT {content}"), params).await?;

		tracing::debug!(id, key = %record.key(), "record inserted");
		Ok(record)
	}

	pub async fn update(&self, id: i64, fields: RecordFields, origin: Origin) -> Result<ProductionRecord, StoreError> {
		let fields = fields.normalized();
		fields.validate()?;

		let _guard = self.gate.write().await;
		let current = self.lookup_id(id).await?.ok_or(StoreError::NotFound(id))?;
		let key = fields.key();
		if let Some(other) = self.lookup_key(&key).await? {
			if other.id != id {
				return Err(StoreError::Conflict(key));
			}
		}

		let now = now_millis();
		let (peer_id, last_synced_at) = match origin {
			Origin::Local => (current.peer_id, current.last_synced_at),
			Origin::Peer { peer_id } => (Some(peer_id), Some(now)),
		};
		let record = ProductionRecord { id, peer_id, fields, last_synced_at, updated_at: now };

		let mut params = Params::new();
		let content = record_content(&record, "", &mut params);
		self.exec(
			format!("UPDATE production_record CONTENT {content} WHERE local_id = $local_id"),
			params,
		)
		.await?;

		Ok(record)
	}

	/// Returns the removed record so callers can forward it.
	pub async fn delete(&self, id: i64) -> Result<ProductionRecord, StoreError> {
		let _guard = self.gate.write().await;
		let current = self.lookup_id(id).await?.ok_or(StoreError::NotFound(id))?;
		self.exec(
			"DELETE production_record WHERE local_id = $local_id".into(),
			vec![("local_id".into(), Param::Int(id))],
		)
		.await?;
		Ok(current)
	}

	/// Swap the whole record set for `records`.
	///
	/// The new set is validated in full before anything is written, and the
	/// swap runs as a single transaction under the exclusive gate. On any
	/// error the previous contents remain exactly as they were.
	pub async fn replace_all(&self, records: Vec<ProductionRecord>) -> Result<(), StoreError> {
		let mut ids = HashSet::with_capacity(records.len());
		let mut keys = HashSet::with_capacity(records.len());
		for record in &records {
			record.fields.validate()?;
			if !ids.insert(record.id) {
				return Err(StoreError::DuplicateId(record.id));
			}
			if !keys.insert(record.key()) {
				return Err(StoreError::Conflict(record.key()));
			}
		}

		let mut sql = String::from("BEGIN TRANSACTION;\nDELETE production_record;\n");
		let mut params = Params::new();
		for (i, record) in records.iter().enumerate() {
			let content = record_content(record, &format!("_{i}"), &mut params);
			sql.push_str(&format!("CREATE production_record CONTENT {content};\n"));
		}
		sql.push_str("COMMIT TRANSACTION;");

		let _guard = self.gate.write().await;

		#[cfg(test)]
		if self.fail_before_swap.swap(false, Ordering::SeqCst) {
			return Err(StoreError::DbError("injected fault before swap".into()));
		}

		self.exec(sql, params).await?;
		tracing::debug!(count = records.len(), "record set replaced");
		Ok(())
	}

	/// Reserve `n` fresh local ids. Ids are never handed out twice, even
	/// when the write they were reserved for fails.
	pub async fn allocate_ids(&self, n: usize) -> Result<Vec<i64>, StoreError> {
		self.next_ids("records", n).await
	}

	/// Records changed since their last exchange with the peer, oldest first.
	pub async fn get_unsynced(&self) -> Result<Vec<ProductionRecord>, StoreError> {
		let mut records: Vec<_> = self.get_all().await?.into_iter().filter(|r| r.is_unsynced()).collect();
		records.reverse();
		Ok(records)
	}

	/// Stamp `ids` as synced as of `as_of`. A record edited after `as_of`
	/// stays unsynced so the newer edit is picked up by the next push.
	pub async fn mark_synced(&self, ids: &[i64], as_of: DateTime<Utc>) -> Result<(), StoreError> {
		if ids.is_empty() {
			return Ok(());
		}
		let _guard = self.gate.write().await;
		self.exec(
			"UPDATE production_record SET last_synced_at = $as_of
             WHERE local_id IN $ids AND updated_at <= $as_of"
				.into(),
			vec![
				("as_of".into(), Param::Int(as_of.timestamp_millis())),
				("ids".into(), Param::Ints(ids.to_vec())),
			],
		)
		.await
	}

	/// Remember the id the peer assigned to a local record.
	pub async fn link_peer(&self, id: i64, peer_id: i64) -> Result<(), StoreError> {
		let _guard = self.gate.write().await;
		self.exec(
			"UPDATE production_record SET peer_id = $peer_id WHERE local_id = $local_id".into(),
			vec![
				("peer_id".into(), Param::Int(peer_id)),
				("local_id".into(), Param::Int(id)),
			],
		)
		.await
	}

	/// Append an audit row; returns it with its assigned sequence number.
	pub async fn append_sync_log(&self, mut entry: SyncLogEntry) -> Result<SyncLogEntry, StoreError> {
		entry.seq = self.next_ids("sync_log", 1).await?[0];

		let mut params: Params = vec![
			("seq".into(), Param::Int(entry.seq)),
			("at".into(), Param::Int(entry.at.timestamp_millis())),
			("direction".into(), Param::Text(entry.direction.as_str().into())),
			("record_ids".into(), Param::Ints(entry.record_ids.clone())),
			("action".into(), Param::Text(entry.action.as_str().into())),
			("outcome".into(), Param::Text(entry.outcome.as_str().into())),
			("severity".into(), Param::Text(entry.severity.as_str().into())),
		];
		let error = match &entry.error {
			Some(e) => {
				params.push(("error".into(), Param::Text(e.clone())));
				"$error"
			}
			None => "NONE",
		};
		let payload = match &entry.payload {
			Some(p) => {
				params.push(("payload".into(), Param::Text(p.to_string())));
				"$payload"
			}
			None => "NONE",
		};

		self.exec(
			format!(
				"CREATE sync_log CONTENT {{
                    seq: $seq,
                    at: $at,
                    direction: $direction,
                    record_ids: $record_ids,
                    action: $action,
                    outcome: $outcome,
                    severity: $severity,
                    error: {error},
                    payload: {payload},
                }}"
			),
			params,
		)
		.await?;

		Ok(entry)
	}

	/// Newest entries first.
	pub async fn recent_sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, StoreError> {
		let rows = self
			.rows(
				format!(
					"SELECT seq, at, direction, record_ids, action, outcome, severity, error, payload
                     FROM sync_log ORDER BY seq DESC LIMIT {limit}"
				),
				Vec::new(),
			)
			.await?;
		rows.into_iter().map(log_from_row).collect()
	}

	#[cfg(test)]
	pub(crate) fn inject_swap_fault(&self) {
		self.fail_before_swap.store(true, Ordering::SeqCst);
	}

	// ─── Unlocked helpers: callers hold the gate ─────────────────

	async fn lookup_id(&self, id: i64) -> Result<Option<ProductionRecord>, StoreError> {
		let rows = self
			.load_where("WHERE local_id = $local_id", vec![("local_id".into(), Param::Int(id))])
			.await?;
		Ok(rows.into_iter().next())
	}

	async fn lookup_key(&self, key: &IdentityKey) -> Result<Option<ProductionRecord>, StoreError> {
		let rows = self
			.load_where(
				"WHERE project_type = $project_type AND title = $title AND scene = $scene AND shot = $shot",
				vec![
					("project_type".into(), Param::Text(key.project_type.clone())),
					("title".into(), Param::Text(key.title.clone())),
					("scene".into(), Param::Text(key.scene.clone())),
					("shot".into(), Param::Text(key.shot.clone())),
				],
			)
			.await?;
		Ok(rows.into_iter().next())
	}

	async fn load_where(&self, clause: &str, params: Params) -> Result<Vec<ProductionRecord>, StoreError> {
		let rows = self
			.rows(
				format!(
					"SELECT {} FROM production_record {clause} ORDER BY updated_at DESC, local_id DESC",
					fields::select_list()
				),
				params,
			)
			.await?;
		rows.into_iter().map(record_from_row).collect()
	}

	async fn next_ids(&self, sequence: &'static str, n: usize) -> Result<Vec<i64>, StoreError> {
		if n == 0 {
			return Ok(Vec::new());
		}
		let rows = self
			.rows(
				format!("UPSERT sequence:{sequence} SET counter = (counter ?? 0) + $n RETURN counter"),
				vec![("n".into(), Param::Int(n as i64))],
			)
			.await?;
		let last = rows
			.first()
			.and_then(|r| r["counter"].as_i64())
			.ok_or_else(|| StoreError::Corrupt(format!("sequence {sequence} returned no counter")))?;
		let first = last - n as i64 + 1;
		Ok((first..=last).collect())
	}

	async fn rows(&self, sql: String, params: Params) -> Result<Vec<serde_json::Value>, StoreError> {
		let mut response = bound_query!(self.db.db, sql, params)
			.await
			.map_err(|e| StoreError::DbError(e.to_string()))?
			.check()
			.map_err(|e| StoreError::DbError(e.to_string()))?;

		response.take(0).map_err(|e| StoreError::DbError(e.to_string()))
	}

	async fn exec(&self, sql: String, params: Params) -> Result<(), StoreError> {
		bound_query!(self.db.db, sql, params)
			.await
			.map_err(|e| StoreError::DbError(e.to_string()))?
			.check()
			.map_err(|e| StoreError::DbError(e.to_string()))?;
		Ok(())
	}
}

/// Current time at the millisecond precision the database keeps.
pub fn now_millis() -> DateTime<Utc> {
	from_millis(Utc::now().timestamp_millis())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Render `record` as a CONTENT object, binding one parameter per present
/// field. Names come from the field table; `suffix` keeps them unique when
/// several records share one query.
fn record_content(record: &ProductionRecord, suffix: &str, params: &mut Params) -> String {
	let mut parts = Vec::with_capacity(RECORD_FIELDS.len());
	for field in RECORD_FIELDS {
		match column_value(record, field.storage) {
			Some(value) => {
				let name = format!("{}{suffix}", field.storage);
				parts.push(format!("{}: ${name}", field.storage));
				params.push((name, value));
			}
			None => parts.push(format!("{}: NONE", field.storage)),
		}
	}
	format!("{{ {} }}", parts.join(", "))
}

fn column_value(record: &ProductionRecord, storage: &str) -> Option<Param> {
	let f = &record.fields;
	match storage {
		"local_id" => Some(Param::Int(record.id)),
		"peer_id" => record.peer_id.map(Param::Int),
		"animator" => Some(Param::Text(f.animator.clone())),
		"project_type" => Some(Param::Text(f.project_type.clone())),
		"title" => Some(Param::Text(f.title.clone())),
		"scene" => Some(Param::Text(f.scene.clone())),
		"shot" => Some(Param::Text(f.shot.clone())),
		"week_code" => Some(Param::Text(f.week_code.to_string())),
		"status" => Some(Param::Text(f.status.as_str().into())),
		"notes" => f.notes.clone().map(Param::Text),
		"last_synced_at" => record.last_synced_at.map(|t| Param::Int(t.timestamp_millis())),
		"updated_at" => Some(Param::Int(record.updated_at.timestamp_millis())),
		_ => None,
	}
}

#[derive(Debug, Deserialize)]
struct RecordRow {
	local_id: i64,
	#[serde(default)]
	peer_id: Option<i64>,
	animator: String,
	project_type: String,
	title: String,
	scene: String,
	shot: String,
	week_code: String,
	status: String,
	#[serde(default)]
	notes: Option<String>,
	#[serde(default)]
	last_synced_at: Option<i64>,
	updated_at: i64,
}

fn record_from_row(row: serde_json::Value) -> Result<ProductionRecord, StoreError> {
	let row: RecordRow =
		serde_json::from_value(row).map_err(|e| StoreError::Corrupt(format!("production_record: {e}")))?;

	Ok(ProductionRecord {
		id: row.local_id,
		peer_id: row.peer_id,
		fields: RecordFields {
			animator: row.animator,
			project_type: row.project_type,
			title: row.title,
			scene: row.scene,
			shot: row.shot,
			week_code: WeekCode::parse(&row.week_code)?,
			status: row.status.parse()?,
			notes: row.notes,
		},
		last_synced_at: row.last_synced_at.map(from_millis),
		updated_at: from_millis(row.updated_at),
	})
}

#[derive(Debug, Deserialize)]
struct LogRow {
	seq: i64,
	at: i64,
	direction: String,
	#[serde(default)]
	record_ids: Vec<i64>,
	action: String,
	outcome: String,
	severity: String,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	payload: Option<String>,
}

fn log_from_row(row: serde_json::Value) -> Result<SyncLogEntry, StoreError> {
	let row: LogRow = serde_json::from_value(row).map_err(|e| StoreError::Corrupt(format!("sync_log: {e}")))?;
	let corrupt = |what: &str, value: &str| StoreError::Corrupt(format!("sync_log.{what}: {value}"));

	Ok(SyncLogEntry {
		seq: row.seq,
		at: from_millis(row.at),
		direction: LogDirection::parse(&row.direction).ok_or_else(|| corrupt("direction", &row.direction))?,
		record_ids: row.record_ids,
		action: SyncAction::parse(&row.action).ok_or_else(|| corrupt("action", &row.action))?,
		outcome: SyncOutcome::parse(&row.outcome).ok_or_else(|| corrupt("outcome", &row.outcome))?,
		severity: Severity::parse(&row.severity).ok_or_else(|| corrupt("severity", &row.severity))?,
		error: row.error,
		payload: row.payload.and_then(|p| serde_json::from_str(&p).ok()),
	})
}

#[cfg(test)]
pub(crate) async fn memory_store() -> RecordStore {
	RecordStore::new(crate::db::init_memory().await.unwrap())
}
