use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use super::{PeerTransport, TransportError};
use crate::{
	config::PeerConfig,
	models::{ChangeNotice, Envelope, ProductionRecord, SnapshotEnvelope},
};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Marks a request as sent by the other node rather than by a client.
pub const PEER_HEADER: &str = "x-shotsync-peer";

/// `PeerTransport` over HTTP+JSON.
pub struct HttpPeer {
	client: Client,
	base_url: String,
	api_key: Option<String>,
	timeout: Duration,
}

impl HttpPeer {
	pub fn new(config: &PeerConfig) -> Result<Self, TransportError> {
		let timeout = Duration::from_secs(config.timeout_secs);
		let client = Client::builder()
			.timeout(timeout)
			.connect_timeout(timeout)
			.build()
			.map_err(|e| TransportError::Config(e.to_string()))?;

		Ok(HttpPeer {
			client,
			base_url: config.url.trim_end_matches('/').to_string(),
			api_key: config.api_key.clone(),
			timeout,
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	fn request(&self, method: Method, path: &str) -> RequestBuilder {
		let builder = self.client.request(method, format!("{}{path}", self.base_url)).header(PEER_HEADER, "1");
		match &self.api_key {
			Some(key) => builder.header(API_KEY_HEADER, key),
			None => builder,
		}
	}

	async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<(StatusCode, T), TransportError> {
		let response = builder.send().await.map_err(|e| self.classify(e))?;
		let status = response.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(TransportError::Auth);
		}
		let body = response.bytes().await.map_err(|e| self.classify(e))?;
		match serde_json::from_slice::<T>(&body) {
			Ok(parsed) => Ok((status, parsed)),
			Err(_) if !status.is_success() => Err(TransportError::Rejected {
				status: status.as_u16(),
				message: String::from_utf8_lossy(&body).chars().take(200).collect(),
			}),
			Err(e) => Err(TransportError::Decode(e.to_string())),
		}
	}

	/// Send and unwrap a `{ success, data, error }` reply.
	async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
		&self,
		method: Method,
		path: &str,
		body: &B,
	) -> Result<Option<T>, TransportError> {
		let (status, envelope): (_, Envelope<T>) = self.send(self.request(method, path).json(body)).await?;
		let message = envelope.error.unwrap_or_default();
		if status == StatusCode::NOT_FOUND {
			return Err(TransportError::NotFound(if message.is_empty() { path.to_string() } else { message }));
		}
		if !status.is_success() || !envelope.success {
			return Err(TransportError::Rejected { status: status.as_u16(), message });
		}
		Ok(envelope.data)
	}

	fn classify(&self, err: reqwest::Error) -> TransportError {
		if err.is_timeout() {
			TransportError::Timeout(self.timeout)
		} else if err.is_decode() {
			TransportError::Decode(err.to_string())
		} else {
			// connect, request and body errors all mean we never got a usable answer
			TransportError::Unreachable(err.to_string())
		}
	}
}

#[async_trait]
impl PeerTransport for HttpPeer {
	async fn fetch_snapshot(&self) -> Result<Vec<ProductionRecord>, TransportError> {
		let (status, snapshot): (_, SnapshotEnvelope) =
			self.send(self.request(Method::GET, "/records/export")).await?;
		if !status.is_success() || !snapshot.success {
			return Err(TransportError::Rejected {
				status: status.as_u16(),
				message: snapshot.error.unwrap_or_default(),
			});
		}
		if snapshot.count != snapshot.data.len() {
			return Err(TransportError::Decode(format!(
				"snapshot count {} does not match {} records",
				snapshot.count,
				snapshot.data.len()
			)));
		}
		Ok(snapshot.data)
	}

	async fn create(&self, record: &ProductionRecord) -> Result<ProductionRecord, TransportError> {
		self.call(Method::POST, "/records", record)
			.await?
			.ok_or_else(|| TransportError::Decode("create reply carried no record".into()))
	}

	async fn update(&self, peer_id: i64, record: &ProductionRecord) -> Result<ProductionRecord, TransportError> {
		self.call(Method::PUT, &format!("/records/{peer_id}"), record)
			.await?
			.ok_or_else(|| TransportError::Decode("update reply carried no record".into()))
	}

	async fn apply(&self, change: &ChangeNotice) -> Result<Option<ProductionRecord>, TransportError> {
		self.call(Method::POST, "/sync/apply", change).await
	}
}
