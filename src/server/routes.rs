use actix_web::{http::StatusCode, web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, Authorized, Caller};
use crate::{
	engine::{SyncStatus, Trigger},
	models::{ChangeNotice, Envelope, ProductionRecord, RecordSubmission, SnapshotEnvelope, SyncDirection, WeekCode},
	service::{MutationOutcome, SyncMeta},
};

type ApiResult = Result<HttpResponse, ApiError>;

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

/// Envelope for client mutations: the record plus the sync outcome, if a
/// pass ran.
#[derive(Serialize)]
struct MutationEnvelope {
	success: bool,
	data: ProductionRecord,
	#[serde(skip_serializing_if = "Option::is_none")]
	sync: Option<SyncMeta>,
}

impl From<MutationOutcome> for MutationEnvelope {
	fn from(outcome: MutationOutcome) -> Self {
		MutationEnvelope { success: true, data: outcome.record, sync: outcome.sync }
	}
}

pub async fn healthz() -> HttpResponse {
	HttpResponse::Ok().json(Envelope::ok(serde_json::json!({ "status": "ok", "weekCode": WeekCode::current() })))
}

pub async fn export(_: Authorized, state: web::Data<AppState>) -> ApiResult {
	let records = state.service.store().get_all().await?;
	Ok(HttpResponse::Ok().json(SnapshotEnvelope {
		success: true,
		count: records.len(),
		data: records,
		timestamp: Utc::now(),
		error: None,
	}))
}

pub async fn list(_: Authorized, state: web::Data<AppState>) -> ApiResult {
	let records = state.service.store().get_all().await?;
	Ok(HttpResponse::Ok().json(Envelope::ok(records)))
}

/// Sender id of a peer write. Client writes drop any `id` they echo back.
fn peer_sender(caller: Caller, id: Option<i64>) -> Result<Option<i64>, ApiError> {
	match (caller, id) {
		(Caller::Peer, Some(sender_id)) => Ok(Some(sender_id)),
		(Caller::Peer, None) => Err(ApiError::new(StatusCode::BAD_REQUEST, "peer write without sender id")),
		(Caller::Client, _) => Ok(None),
	}
}

pub async fn create(
	_: Authorized,
	caller: Caller,
	state: web::Data<AppState>,
	body: web::Json<RecordSubmission>,
) -> ApiResult {
	let RecordSubmission { id, fields } = body.into_inner();
	match peer_sender(caller, id)? {
		Some(sender_id) => {
			let record = state.service.accept_peer_create(sender_id, fields).await?;
			Ok(HttpResponse::Created().json(Envelope::ok(record)))
		}
		None => {
			let outcome = state.service.create(fields).await?;
			Ok(HttpResponse::Created().json(MutationEnvelope::from(outcome)))
		}
	}
}

pub async fn update(
	_: Authorized,
	caller: Caller,
	state: web::Data<AppState>,
	path: web::Path<i64>,
	body: web::Json<RecordSubmission>,
) -> ApiResult {
	let id = path.into_inner();
	let RecordSubmission { id: sender, fields } = body.into_inner();
	match peer_sender(caller, sender)? {
		Some(sender_id) => {
			let record = state.service.accept_peer_update(id, sender_id, fields).await?;
			Ok(HttpResponse::Ok().json(Envelope::ok(record)))
		}
		None => {
			let outcome = state.service.update(id, fields).await?;
			Ok(HttpResponse::Ok().json(MutationEnvelope::from(outcome)))
		}
	}
}

pub async fn delete(_: Authorized, state: web::Data<AppState>, path: web::Path<i64>) -> ApiResult {
	let outcome = state.service.delete(path.into_inner()).await?;
	Ok(HttpResponse::Ok().json(MutationEnvelope::from(outcome)))
}

pub async fn apply(_: Authorized, state: web::Data<AppState>, body: web::Json<ChangeNotice>) -> ApiResult {
	let change = body.into_inner();
	tracing::debug!(action = change.action.as_str(), sender_id = change.data.id, "change received from peer");
	let envelope = match state.service.apply_remote(change).await? {
		Some(record) => Envelope::ok(record),
		None => Envelope::empty(),
	};
	Ok(HttpResponse::Ok().json(envelope))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
	#[serde(default)]
	direction: Option<SyncDirection>,
}

pub async fn trigger(
	_: Authorized,
	state: web::Data<AppState>,
	body: Option<web::Json<TriggerRequest>>,
) -> ApiResult {
	let orchestrator = state
		.service
		.orchestrator()
		.ok_or_else(|| ApiError::new(StatusCode::CONFLICT, "sync disabled: no peer configured"))?;
	let direction = body.and_then(|b| b.into_inner().direction).unwrap_or(SyncDirection::Bidirectional);

	let report = orchestrator.trigger(Trigger::Manual, direction).await?;
	Ok(HttpResponse::Ok().json(Envelope::ok(report)))
}

/// Body of `GET /sync/status`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
	pub enabled: bool,
	pub records: usize,
	pub unsynced: usize,
	pub sync: serde_json::Value,
}

pub async fn status(_: Authorized, state: web::Data<AppState>) -> ApiResult {
	let store = state.service.store();
	let orchestrator = state.service.orchestrator();
	let sync = orchestrator.map(|o| o.status()).unwrap_or_else(SyncStatus::default);
	let view = StatusView {
		enabled: orchestrator.is_some(),
		records: store.count().await?,
		unsynced: store.get_unsynced().await?.len(),
		sync: serde_json::to_value(sync).unwrap_or_default(),
	};
	Ok(HttpResponse::Ok().json(Envelope::ok(view)))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
	limit: Option<usize>,
}

pub async fn sync_log(_: Authorized, state: web::Data<AppState>, query: web::Query<LogQuery>) -> ApiResult {
	let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
	let entries = state.service.store().recent_sync_log(limit).await?;
	Ok(HttpResponse::Ok().json(Envelope::ok(entries)))
}

pub async fn structure(_: Authorized, state: web::Data<AppState>) -> ApiResult {
	let tree = state.structure.scan().await?;
	Ok(HttpResponse::Ok().json(Envelope::ok(tree)))
}
