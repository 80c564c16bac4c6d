use std::{future::Future, net::TcpListener, sync::Arc, time::Duration};

use serde_json::{json, Value};
use shotsync::{
	config::{PeerConfig, SyncConfig},
	db,
	engine::{Notifier, Orchestrator, Reconciler, SyncError, Trigger},
	models::{RecordStatus, SyncDirection},
	server::{self, AppState},
	service::RecordService,
	store::{Origin, RecordStore},
	structure::StructureProvider,
	transport::{HttpPeer, PeerTransport, API_KEY_HEADER},
};

struct Node {
	store: Arc<RecordStore>,
	orchestrator: Arc<Orchestrator>,
	url: String,
	key: String,
}

impl Node {
	async fn call(&self, request: reqwest::RequestBuilder) -> Value {
		let response = request.header(API_KEY_HEADER, &self.key).send().await.unwrap();
		assert!(response.status().is_success(), "{}", response.status());
		response.json().await.unwrap()
	}
}

/// Two nodes on loopback, each configured with the other as its peer.
/// Node A sends `key-a`; `b_accepts` is the key node B expects.
async fn pair(b_accepts: &str) -> (Node, Node) {
	let listeners = [TcpListener::bind("127.0.0.1:0").unwrap(), TcpListener::bind("127.0.0.1:0").unwrap()];
	let urls: Vec<String> = listeners.iter().map(|l| format!("http://{}", l.local_addr().unwrap())).collect();
	let sends = ["key-a", "key-b"];
	let accepts = ["key-b", b_accepts];

	let mut nodes = Vec::new();
	for (i, listener) in listeners.into_iter().enumerate() {
		let store = Arc::new(RecordStore::new(db::init_memory().await.unwrap()));
		let peer_config = PeerConfig { url: urls[1 - i].clone(), api_key: Some(sends[i].into()), timeout_secs: 5 };
		let peer: Arc<dyn PeerTransport> = Arc::new(HttpPeer::new(&peer_config).unwrap());
		let orchestrator = Orchestrator::new(Reconciler::new(store.clone(), peer.clone()), SyncConfig::default(), None);
		let service = RecordService::new(store.clone())
			.with_notifier(Notifier::new(peer, store.clone()))
			.with_orchestrator(orchestrator.clone(), false);
		let state = AppState {
			service: Arc::new(service),
			structure: StructureProvider::new(None),
			api_key: Some(accepts[i].into()),
		};
		let (server, _) = server::start_on(state, listener).unwrap();
		actix_web::rt::spawn(server);
		nodes.push(Node { store, orchestrator, url: urls[i].clone(), key: accepts[i].into() });
	}

	let b = nodes.pop().unwrap();
	let a = nodes.pop().unwrap();
	(a, b)
}

async fn eventually<F, Fut>(mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..100 {
		if check().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("condition not reached");
}

fn body(shot: &str) -> Value {
	json!({
		"animator": "A",
		"projectType": "long-form",
		"title": "Ep1",
		"scene": "SC_01",
		"shot": shot,
		"weekCode": "20250106",
		"status": "submitted"
	})
}

#[actix_web::test]
async fn mutations_fan_out_and_passes_converge() {
	let (a, b) = pair("key-a").await;
	let client = reqwest::Client::new();

	let created = a.call(client.post(format!("{}/records", a.url)).json(&body("SH_01"))).await;
	let a_id = created["data"]["id"].as_i64().unwrap();

	eventually(|| async { b.store.count().await.unwrap() == 1 }).await;
	let on_b = b.store.get_all().await.unwrap().remove(0);
	assert_eq!(on_b.peer_id, Some(a_id));
	assert!(!on_b.is_unsynced());

	eventually(|| async { a.store.get(a_id).await.unwrap().peer_id.is_some() }).await;
	assert_eq!(a.store.get(a_id).await.unwrap().peer_id, Some(on_b.id));

	// edit on A without fan-out, then push it through a pass
	let mut fields = on_b.fields.clone();
	fields.status = RecordStatus::Approved;
	tokio::time::sleep(Duration::from_millis(5)).await;
	a.store.update(a_id, fields.clone(), Origin::Local).await.unwrap();
	let report = a.orchestrator.trigger(Trigger::Manual, SyncDirection::Push).await.unwrap();
	assert_eq!(report.push.unwrap().updated, 1);
	assert_eq!(b.store.get(on_b.id).await.unwrap().fields.status, RecordStatus::Approved);

	// B pulls A's snapshot: same data, nothing to change
	let report = b.orchestrator.trigger(Trigger::Manual, SyncDirection::Pull).await.unwrap();
	let pull = report.pull.unwrap();
	assert_eq!((pull.received, pull.unchanged, pull.removed), (1, 1, 0));

	// delete on B fans out to A
	b.call(client.delete(format!("{}/records/{}", b.url, on_b.id))).await;
	eventually(|| async { a.store.count().await.unwrap() == 0 }).await;

	let status = a.call(client.get(format!("{}/sync/status", a.url))).await;
	assert_eq!(status["data"]["sync"]["succeeded"], json!(1));
}

#[actix_web::test]
async fn wrong_key_surfaces_as_auth_error() {
	let (a, b) = pair("something-else").await;
	b.store.insert(serde_json::from_value(body("SH_01")).unwrap(), Origin::Local).await.unwrap();

	let err = a.orchestrator.trigger(Trigger::Manual, SyncDirection::Pull).await.unwrap_err();

	assert!(matches!(err, SyncError::Auth { direction: SyncDirection::Pull }), "{err:?}");
	assert!(!err.is_retryable());
	assert_eq!(a.store.count().await.unwrap(), 0);
}
