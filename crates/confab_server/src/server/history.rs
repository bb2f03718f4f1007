#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use confab_domain::{ChannelId, Message, MessageDraft};
use confab_protocol::{ErrorCode, SendKind};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::auth::TokenVerifier;
use super::directory::JoinError;
use super::dispatcher::{BroadcastDispatcher, PublishError, draft_from_wire};
use super::store::{MessageStore, clamp_limit};

/// Read side of the message archive: pages are fetched newest-first from
/// the store, then reversed so callers always render oldest-to-newest.
pub struct MessageHistoryService {
	store: Arc<dyn MessageStore>,
}

impl MessageHistoryService {
	pub fn new(store: Arc<dyn MessageStore>) -> Self {
		Self { store }
	}

	/// Fetches up to `limit` messages older than `before_unix_ms` (or the
	/// newest page when absent), in chronological order.
	pub async fn fetch(&self, channel_id: &ChannelId, before_unix_ms: Option<i64>, limit: Option<u32>) -> anyhow::Result<Vec<Message>> {
		let mut page = self.store.query_page(channel_id, before_unix_ms, clamp_limit(limit)).await?;
		page.reverse();
		Ok(page)
	}
}

pub struct HttpApi {
	history: MessageHistoryService,
	dispatcher: Arc<BroadcastDispatcher>,
	verifier: Arc<dyn TokenVerifier>,
}

impl HttpApi {
	pub fn new(history: MessageHistoryService, dispatcher: Arc<BroadcastDispatcher>, verifier: Arc<dyn TokenVerifier>) -> Self {
		Self {
			history,
			dispatcher,
			verifier,
		}
	}
}

pub fn spawn_http_api(bind: SocketAddr, api: Arc<HttpApi>) {
	tokio::spawn(async move {
		if let Err(err) = run_http_api(bind, api).await {
			warn!(error = %err, "http api stopped");
		}
	});
}

async fn run_http_api(bind: SocketAddr, api: Arc<HttpApi>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	serve_http_api(listener, api).await
}

pub async fn serve_http_api(listener: TcpListener, api: Arc<HttpApi>) -> anyhow::Result<()> {
	info!(bind = %listener.local_addr()?, "http api listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let api = api.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, api.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http api connection error");
			}
		});
	}
}

#[derive(Deserialize)]
struct PostMessageBody {
	#[serde(alias = "channelId")]
	channel_id: Option<String>,
	#[serde(alias = "message")]
	body: String,
	#[serde(default)]
	kind: SendKind,
	#[serde(default, alias = "imageUrl")]
	media_ref: Option<String>,
	#[serde(default, alias = "username")]
	display_name: Option<String>,
	#[serde(default, alias = "userAvatar")]
	avatar_ref: Option<String>,
}

async fn handle_request(req: Request<Incoming>, api: Arc<HttpApi>) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let response = match (method, path.as_str()) {
		(Method::GET, p) if p == "/api/messages" || p.starts_with("/api/messages/") => handle_get_messages(req, &api).await,
		(Method::POST, "/api/messages") => handle_post_message(req, &api).await,
		_ => Ok(error_response(StatusCode::NOT_FOUND, ErrorCode::NotFound, "no such route")),
	};

	match response {
		Ok(resp) => Ok(resp),
		Err(err) => {
			warn!(error = %err, "http api request failed");
			Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::ServerError, "internal error"))
		}
	}
}

async fn authenticate(req: &Request<Incoming>, api: &HttpApi) -> Result<confab_domain::Identity, Response<Full<Bytes>>> {
	let token = req
		.headers()
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));

	let Some(token) = token else {
		return Err(error_response(StatusCode::UNAUTHORIZED, ErrorCode::Unauthenticated, "missing bearer token"));
	};

	api.verifier
		.verify(token)
		.await
		.map_err(|e| error_response(StatusCode::UNAUTHORIZED, ErrorCode::Unauthenticated, &e.to_string()))
}

async fn handle_get_messages(req: Request<Incoming>, api: &HttpApi) -> anyhow::Result<Response<Full<Bytes>>> {
	if let Err(resp) = authenticate(&req, api).await {
		return Ok(resp);
	}

	let channel_id = match channel_from_path(req.uri().path()) {
		Ok(id) => id,
		Err(resp) => return Ok(resp),
	};

	let (before, limit) = match paging_params(req.uri().query()) {
		Ok(p) => p,
		Err(resp) => return Ok(resp),
	};

	let page = api.history.fetch(&channel_id, before, limit).await?;
	json_response(StatusCode::OK, &page)
}

async fn handle_post_message(req: Request<Incoming>, api: &HttpApi) -> anyhow::Result<Response<Full<Bytes>>> {
	let identity = match authenticate(&req, api).await {
		Ok(identity) => identity,
		Err(resp) => return Ok(resp),
	};

	let bytes = req.into_body().collect().await?.to_bytes();
	let body: PostMessageBody = match serde_json::from_slice(&bytes) {
		Ok(body) => body,
		Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, &format!("invalid body: {e}"))),
	};

	let channel_id = match body.channel_id {
		Some(raw) => match raw.parse::<ChannelId>() {
			Ok(id) => id,
			Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, &e.to_string())),
		},
		None => ChannelId::fallback(),
	};

	let draft: MessageDraft = match draft_from_wire(body.kind, body.body, body.media_ref) {
		Ok(draft) => draft,
		Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, &e.to_string())),
	};

	let message = api
		.dispatcher
		.publish_as(&identity, channel_id, draft, body.display_name, body.avatar_ref)
		.await;

	match message {
		Ok(message) => json_response(StatusCode::CREATED, &message),
		Err(PublishError::InvalidDraft(e)) => Ok(error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, &e.to_string())),
		Err(PublishError::Unauthenticated) => Ok(error_response(StatusCode::UNAUTHORIZED, ErrorCode::Unauthenticated, "not authenticated")),
		Err(PublishError::Denied(e)) => {
			let (status, code) = match e {
				JoinError::UnknownChannel(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
				JoinError::NotAMember { .. } => (StatusCode::FORBIDDEN, ErrorCode::AuthorizationDenied),
			};
			Ok(error_response(status, code, &e.to_string()))
		}
		Err(PublishError::Store(e)) => {
			warn!(error = %e, "message persist failed");
			Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::StoreFailure, "could not persist message"))
		}
	}
}

pub(crate) fn channel_from_path(path: &str) -> Result<ChannelId, Response<Full<Bytes>>> {
	match path.strip_prefix("/api/messages/").filter(|rest| !rest.is_empty()) {
		None => Ok(ChannelId::fallback()),
		Some(raw) => raw
			.parse::<ChannelId>()
			.map_err(|e| error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, &e.to_string())),
	}
}

pub(crate) fn paging_params(query: Option<&str>) -> Result<(Option<i64>, Option<u32>), Response<Full<Bytes>>> {
	let mut before = None;
	let mut limit = None;
	for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
		let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
		match key {
			"before" => {
				before = Some(value.parse::<i64>().map_err(|_| {
					error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, "before must be a unix millisecond timestamp")
				})?);
			}
			"limit" => {
				limit = Some(
					value
						.parse::<u32>()
						.map_err(|_| error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, "limit must be a positive integer"))?,
				);
			}
			_ => {}
		}
	}
	Ok((before, limit))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> anyhow::Result<Response<Full<Bytes>>> {
	let body = serde_json::to_vec(value)?;
	Ok(Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap_or_default())
}

fn error_response(status: StatusCode, code: ErrorCode, reason: &str) -> Response<Full<Bytes>> {
	let body = serde_json::json!({ "error": code.as_str(), "reason": reason });
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap_or_default()
}
