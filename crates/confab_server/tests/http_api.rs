#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use confab_domain::{ChannelId, Message, MessageDraft, SubjectId};
use confab_server::server::auth::{AuthClaims, HmacTokenVerifier, mint_hmac_token};
use confab_server::server::directory::OpenDirectory;
use confab_server::server::dispatcher::BroadcastDispatcher;
use confab_server::server::history::{HttpApi, MessageHistoryService, serve_http_api};
use confab_server::server::registry::SubscriptionRegistry;
use confab_server::server::store::{MemoryMessageStore, MessageStore, NewMessage};
use confab_server::util::secret::SecretString;

const SECRET: &str = "http-test-secret";

fn token_for(sub: &str, name: &str) -> String {
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
	mint_hmac_token(
		&AuthClaims {
			sub: sub.to_string(),
			exp: now + 3600,
			name: Some(name.to_string()),
			avatar: None,
		},
		SECRET,
	)
}

async fn start_api() -> (SocketAddr, Arc<dyn MessageStore>) {
	let registry = Arc::new(SubscriptionRegistry::new());
	let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
	let dispatcher = Arc::new(BroadcastDispatcher::new(registry, store.clone(), Arc::new(OpenDirectory::new())));
	let verifier = Arc::new(HmacTokenVerifier::new(SecretString::new(SECRET.to_string())));

	let api = Arc::new(HttpApi::new(MessageHistoryService::new(store.clone()), dispatcher, verifier));
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		let _ = serve_http_api(listener, api).await;
	});

	(addr, store)
}

fn new_message(channel: &str, body: &str) -> NewMessage {
	NewMessage {
		channel_id: ChannelId::new(channel).expect("valid ChannelId"),
		author_id: SubjectId::new("u1").expect("valid SubjectId"),
		author_display_name: "u1-name".to_string(),
		author_avatar_ref: None,
		draft: MessageDraft::text(body.to_string()).expect("valid draft"),
	}
}

#[tokio::test]
async fn history_requires_a_bearer_token() {
	let (addr, _store) = start_api().await;
	let client = reqwest::Client::new();

	let resp = client
		.get(format!("http://{addr}/api/messages/general"))
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
	let body: serde_json::Value = resp.json().await.expect("json body");
	assert_eq!(body["error"], "unauthenticated");

	let resp = client
		.get(format!("http://{addr}/api/messages/general"))
		.header("Authorization", "Bearer v1.bogus.bogus")
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn history_pages_are_chronological_with_default_limit() {
	let (addr, store) = start_api().await;
	for i in 0..55 {
		store.append(new_message("general", &format!("m{i}"))).await.expect("append");
	}

	let client = reqwest::Client::new();
	let resp = client
		.get(format!("http://{addr}/api/messages/general"))
		.header("Authorization", format!("Bearer {}", token_for("alice", "Alice")))
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::OK);

	let page: Vec<Message> = resp.json().await.expect("json body");
	assert_eq!(page.len(), 50);
	assert_eq!(page[0].body, "m5");
	assert_eq!(page[49].body, "m54");
	for pair in page.windows(2) {
		assert!(pair[0].created_at_unix_ms <= pair[1].created_at_unix_ms);
	}
}

#[tokio::test]
async fn posting_a_message_persists_it() {
	let (addr, store) = start_api().await;
	let client = reqwest::Client::new();

	let resp = client
		.post(format!("http://{addr}/api/messages"))
		.header("Authorization", format!("Bearer {}", token_for("alice", "Alice")))
		.json(&serde_json::json!({ "channel_id": "general", "body": "posted over http" }))
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

	let message: Message = resp.json().await.expect("json body");
	assert_eq!(message.body, "posted over http");
	assert_eq!(message.author_id.as_str(), "alice");
	assert_eq!(message.author_display_name, "Alice");

	let page = store.query_page(&ChannelId::fallback(), None, 50).await.expect("query");
	assert_eq!(page.len(), 1);
	assert_eq!(page[0].id, message.id);
}

#[tokio::test]
async fn malformed_posts_are_rejected() {
	let (addr, _store) = start_api().await;
	let client = reqwest::Client::new();
	let token = token_for("alice", "Alice");

	let resp = client
		.post(format!("http://{addr}/api/messages"))
		.header("Authorization", format!("Bearer {token}"))
		.body("not json")
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

	let resp = client
		.post(format!("http://{addr}/api/messages"))
		.header("Authorization", format!("Bearer {token}"))
		.json(&serde_json::json!({ "body": "", "kind": "text" }))
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
	let body: serde_json::Value = resp.json().await.expect("json body");
	assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn readiness_flips_after_mark_ready() {
	use confab_server::server::health::{HealthState, serve_health};

	let state = HealthState::new();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	let server_state = state.clone();
	tokio::spawn(async move {
		let _ = serve_health(listener, server_state).await;
	});

	let client = reqwest::Client::new();
	let resp = client.get(format!("http://{addr}/healthz")).send().await.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::OK);
	assert_eq!(resp.text().await.expect("body"), "ok");

	let resp = client.get(format!("http://{addr}/readyz")).send().await.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

	state.mark_ready();
	let resp = client.get(format!("http://{addr}/readyz")).send().await.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::OK);
	assert_eq!(resp.text().await.expect("body"), "ready");
}

#[tokio::test]
async fn non_members_cannot_post_into_a_room_channel() {
	use confab_domain::{Channel, ChannelKind, Room, RoomId};
	use confab_server::server::directory::StaticDirectory;

	let directory = Arc::new(StaticDirectory::new());
	directory
		.insert_room(Room {
			id: RoomId::new("team").unwrap(),
			channels: vec![Channel {
				id: ChannelId::new("private").unwrap(),
				name: "private".to_string(),
				kind: ChannelKind::Text,
			}],
			members: vec![SubjectId::new("alice").unwrap()],
		})
		.await;

	let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
	let dispatcher = Arc::new(BroadcastDispatcher::new(Arc::new(SubscriptionRegistry::new()), store.clone(), directory));
	let verifier = Arc::new(HmacTokenVerifier::new(SecretString::new(SECRET.to_string())));
	let api = Arc::new(HttpApi::new(MessageHistoryService::new(store.clone()), dispatcher, verifier));
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		let _ = serve_http_api(listener, api).await;
	});

	let resp = reqwest::Client::new()
		.post(format!("http://{addr}/api/messages"))
		.header("Authorization", format!("Bearer {}", token_for("bob", "Bob")))
		.json(&serde_json::json!({ "channel_id": "private", "body": "intruding" }))
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
	let body: serde_json::Value = resp.json().await.expect("json body");
	assert_eq!(body["error"], "authorization_denied");

	let page = store.query_page(&ChannelId::new("private").unwrap(), None, 50).await.expect("query");
	assert!(page.is_empty());
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
	let (addr, _store) = start_api().await;
	let resp = reqwest::Client::new()
		.get(format!("http://{addr}/api/rooms"))
		.send()
		.await
		.expect("request");
	assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}
