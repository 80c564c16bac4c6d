//! HTTP surface: the symmetric peer protocol plus operator endpoints.

mod routes;

use std::{
	future::Ready,
	net::{SocketAddr, TcpListener},
	sync::Arc,
};

use actix_web::{
	dev::{Payload, Server},
	http::StatusCode,
	web, App, FromRequest, HttpRequest, HttpResponse, HttpServer, ResponseError,
};

use crate::{
	engine::SyncError,
	models::Envelope,
	service::RecordService,
	store::StoreError,
	structure::{StructureError, StructureProvider},
	transport::{TransportError, API_KEY_HEADER, PEER_HEADER},
};

pub struct AppState {
	pub service: Arc<RecordService>,
	pub structure: StructureProvider,
	/// Expected `x-api-key`. `None` accepts every caller.
	pub api_key: Option<String>,
}

/// Bind and start serving. Returns the running server and its bound
/// address, which differs from `bind` when port 0 was requested.
pub fn start(state: AppState, bind: &str) -> std::io::Result<(Server, SocketAddr)> {
	let listener = TcpListener::bind(bind)?;
	start_on(state, listener)
}

pub fn start_on(state: AppState, listener: TcpListener) -> std::io::Result<(Server, SocketAddr)> {
	let addr = listener.local_addr()?;
	if state.api_key.is_none() {
		tracing::warn!("server.api_key is not set, every caller is accepted");
	}
	let data = web::Data::new(state);
	let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
		.listen(listener)?
		.run();

	tracing::info!(%addr, "listening");
	Ok((server, addr))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
	cfg.app_data(web::JsonConfig::default().error_handler(|err, _| {
		ApiError::new(StatusCode::BAD_REQUEST, format!("malformed body: {err}")).into()
	}))
	.route("/healthz", web::get().to(routes::healthz))
	.route("/records/export", web::get().to(routes::export))
	.route("/records", web::get().to(routes::list))
	.route("/records", web::post().to(routes::create))
	.route("/records/{id}", web::put().to(routes::update))
	.route("/records/{id}", web::delete().to(routes::delete))
	.route("/sync/apply", web::post().to(routes::apply))
	.route("/sync/trigger", web::post().to(routes::trigger))
	.route("/sync/status", web::get().to(routes::status))
	.route("/sync/log", web::get().to(routes::sync_log))
	.route("/structure", web::get().to(routes::structure));
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	message: String,
	details: Option<serde_json::Value>,
}

impl ApiError {
	fn new(status: StatusCode, message: impl Into<String>) -> Self {
		ApiError { status, message: message.into(), details: None }
	}

	fn with_details(mut self, details: impl serde::Serialize) -> Self {
		self.details = serde_json::to_value(details).ok();
		self
	}
}

impl std::fmt::Display for ApiError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.status, self.message)
	}
}

impl ResponseError for ApiError {
	fn status_code(&self) -> StatusCode {
		self.status
	}

	fn error_response(&self) -> HttpResponse {
		let body = Envelope { success: false, data: self.details.clone(), error: Some(self.message.clone()) };
		HttpResponse::build(self.status).json(body)
	}
}

impl From<StoreError> for ApiError {
	fn from(err: StoreError) -> Self {
		let status = match &err {
			StoreError::Conflict(_) => StatusCode::CONFLICT,
			StoreError::NotFound(_) => StatusCode::NOT_FOUND,
			StoreError::Invalid(_) | StoreError::DuplicateId(_) => StatusCode::UNPROCESSABLE_ENTITY,
			StoreError::Corrupt(_) | StoreError::DbError(_) => {
				tracing::error!(error = %err, "store failure");
				StatusCode::INTERNAL_SERVER_ERROR
			}
		};
		ApiError::new(status, err.to_string())
	}
}

impl From<SyncError> for ApiError {
	fn from(err: SyncError) -> Self {
		let status = match &err {
			SyncError::Busy => StatusCode::CONFLICT,
			SyncError::Transport { source: TransportError::Timeout(_), .. } => StatusCode::GATEWAY_TIMEOUT,
			SyncError::Transport { .. } | SyncError::Auth { .. } | SyncError::PartialBatch { .. } => {
				StatusCode::BAD_GATEWAY
			}
			SyncError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
		};
		let message = err.to_string();
		match err {
			SyncError::PartialBatch { report, .. } => ApiError::new(status, message).with_details(report),
			_ => ApiError::new(status, message),
		}
	}
}

impl From<StructureError> for ApiError {
	fn from(err: StructureError) -> Self {
		let status = match &err {
			StructureError::NotConfigured | StructureError::RootNotExists(_) => StatusCode::NOT_FOUND,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		ApiError::new(status, err.to_string())
	}
}

/// Extractor that admits a request only when its `x-api-key` matches.
pub struct Authorized;

impl FromRequest for Authorized {
	type Error = ApiError;
	type Future = Ready<Result<Self, Self::Error>>;

	fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
		let expected = req.app_data::<web::Data<AppState>>().and_then(|s| s.api_key.as_deref());
		let result = match expected {
			None => Ok(Authorized),
			Some(key) => match req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
				Some(given) if given == key => Ok(Authorized),
				Some(_) => Err(ApiError::new(StatusCode::FORBIDDEN, "invalid api key")),
				None => Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing api key")),
			},
		};
		std::future::ready(result)
	}
}

/// Who sent a write: the other node's transport marks its requests with
/// `x-shotsync-peer`, everything else is a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
	Peer,
	Client,
}

impl FromRequest for Caller {
	type Error = ApiError;
	type Future = Ready<Result<Self, Self::Error>>;

	fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
		let caller = if req.headers().contains_key(PEER_HEADER) { Caller::Peer } else { Caller::Client };
		std::future::ready(Ok(caller))
	}
}
