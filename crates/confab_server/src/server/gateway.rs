#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use confab_domain::ChannelId;
use confab_protocol::{ClientEvent, ErrorCode, ServerEvent, decode_client_event, encode_event};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use super::auth::TokenVerifier;
use super::directory::{JoinError, RoomDirectory, authorize_join};
use super::dispatcher::{BroadcastDispatcher, PublishError, draft_from_wire};
use super::registry::{ConnId, SubscriptionRegistry};
use crate::config::ServerSettings;
use crate::util::time::unix_ms_now;

const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Everything a connection handler needs, bundled so the accept loop
/// clones one Arc per connection.
pub struct Gateway {
	pub registry: Arc<SubscriptionRegistry>,
	pub dispatcher: Arc<BroadcastDispatcher>,
	pub verifier: Arc<dyn TokenVerifier>,
	pub directory: Arc<dyn RoomDirectory>,
	pub settings: ServerSettings,
}

struct ConnGauge;

impl ConnGauge {
	fn attach() -> Self {
		metrics::gauge!("confab_connections_open").increment(1.0);
		Self
	}
}

impl Drop for ConnGauge {
	fn drop(&mut self) {
		metrics::gauge!("confab_connections_open").decrement(1.0);
	}
}

impl Gateway {
	/// Drives one accepted TCP stream through websocket upgrade, the auth
	/// handshake, and the event loop. Returns when the peer disconnects
	/// or the handshake fails; the connection is always unregistered on
	/// the way out.
	pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
		let _gauge = ConnGauge::attach();

		let ws = match tokio_tungstenite::accept_async(stream).await {
			Ok(ws) => ws,
			Err(e) => {
				debug!(%peer, error = %e, "websocket upgrade failed");
				return;
			}
		};
		let (mut ws_tx, mut ws_rx) = ws.split();

		// The first frame must be an auth event, within the handshake
		// deadline. Anything else closes the connection.
		let identity = match self.authenticate(&mut ws_tx, &mut ws_rx, peer).await {
			Some(identity) => identity,
			None => {
				let _ = ws_tx.close().await;
				return;
			}
		};

		let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_DEPTH);
		let conn = self.registry.register(identity.clone(), outbound_tx.clone()).await;
		info!(%peer, subject = %identity.subject_id, ?conn, "connection authenticated");

		let welcome = ServerEvent::Welcome {
			subject_id: identity.subject_id.clone(),
			server_time_unix_ms: unix_ms_now(),
		};
		if outbound_tx.send(welcome).await.is_err() {
			self.registry.unregister(conn).await;
			return;
		}

		// Writer task: serializes everything queued for this peer. The
		// event loop only ever touches the sender half.
		let writer = tokio::spawn(async move {
			while let Some(event) = outbound_rx.recv().await {
				let frame = match encode_event(&event) {
					Ok(frame) => frame,
					Err(e) => {
						warn!(error = %e, "failed to encode outbound event");
						continue;
					}
				};
				if ws_tx.send(WsMessage::text(frame)).await.is_err() {
					break;
				}
			}
			let _ = ws_tx.close().await;
		});

		while let Some(frame) = ws_rx.next().await {
			let frame = match frame {
				Ok(frame) => frame,
				Err(e) => {
					debug!(%peer, error = %e, "websocket read error");
					break;
				}
			};

			let text = match frame {
				WsMessage::Text(text) => text,
				WsMessage::Close(_) => break,
				WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
				WsMessage::Binary(_) | WsMessage::Frame(_) => {
					self.send_error(&outbound_tx, ErrorCode::BadRequest, "text frames only").await;
					continue;
				}
			};

			let event = match decode_client_event(text.as_ref()) {
				Ok(event) => event,
				Err(e) => {
					self.send_error(&outbound_tx, ErrorCode::BadRequest, &e.to_string()).await;
					continue;
				}
			};

			self.handle_event(conn, event, &outbound_tx).await;
		}

		self.registry.unregister(conn).await;
		drop(outbound_tx);
		let _ = writer.await;
		info!(%peer, ?conn, "connection closed");
	}

	async fn authenticate(
		&self,
		ws_tx: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
		ws_rx: &mut (impl StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
		peer: SocketAddr,
	) -> Option<confab_domain::Identity> {
		let deadline = tokio::time::timeout(self.settings.auth_timeout, ws_rx.next());
		let first = match deadline.await {
			Ok(Some(Ok(WsMessage::Text(text)))) => text,
			Ok(Some(Ok(_))) | Ok(Some(Err(_))) | Ok(None) => {
				debug!(%peer, "connection dropped before auth");
				return None;
			}
			Err(_) => {
				debug!(%peer, "auth handshake timed out");
				let _ = self.reject(ws_tx, "auth timed out").await;
				return None;
			}
		};

		let token = match decode_client_event(first.as_ref()) {
			Ok(ClientEvent::Auth { token }) => token,
			Ok(_) => {
				let _ = self.reject(ws_tx, "first event must be auth").await;
				return None;
			}
			Err(e) => {
				let _ = self.reject(ws_tx, &e.to_string()).await;
				return None;
			}
		};

		match self.verifier.verify(&token).await {
			Ok(identity) => Some(identity),
			Err(e) => {
				debug!(%peer, error = %e, "token rejected");
				let _ = self.reject(ws_tx, &e.to_string()).await;
				None
			}
		}
	}

	async fn reject(
		&self,
		ws_tx: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
		reason: &str,
	) -> Result<(), tokio_tungstenite::tungstenite::Error> {
		metrics::counter!("confab_handshakes_rejected").increment(1);
		let event = ServerEvent::error(ErrorCode::Unauthenticated, reason);
		match encode_event(&event) {
			Ok(frame) => ws_tx.send(WsMessage::text(frame)).await,
			Err(_) => Ok(()),
		}
	}

	async fn send_error(&self, outbound: &mpsc::Sender<ServerEvent>, code: ErrorCode, reason: &str) {
		let _ = outbound.send(ServerEvent::error(code, reason)).await;
	}

	async fn handle_event(&self, conn: ConnId, event: ClientEvent, outbound: &mpsc::Sender<ServerEvent>) {
		match event {
			ClientEvent::Auth { .. } => {
				// Already authenticated; a second auth is a protocol error
				// but not worth killing the connection over.
				self.send_error(outbound, ErrorCode::BadRequest, "already authenticated").await;
			}
			ClientEvent::JoinChannel { channel_id } => {
				let Some(identity) = self.registry.identity_of(conn).await else {
					self.send_error(outbound, ErrorCode::Unauthenticated, "not registered").await;
					return;
				};
				match authorize_join(self.directory.as_ref(), &identity.subject_id, &channel_id).await {
					Ok(()) => {
						let joined = self.registry.join(conn, &channel_id).await;
						debug!(?conn, channel = %channel_id, joined, "join channel");
					}
					Err(e) => {
						let code = match e {
							JoinError::UnknownChannel(_) => ErrorCode::NotFound,
							JoinError::NotAMember { .. } => ErrorCode::AuthorizationDenied,
						};
						self.send_error(outbound, code, &e.to_string()).await;
					}
				}
			}
			ClientEvent::LeaveChannel { channel_id } => {
				let left = self.registry.leave(conn, &channel_id).await;
				debug!(?conn, channel = %channel_id, left, "leave channel");
			}
			ClientEvent::SendMessage {
				channel_id,
				body,
				kind,
				media_ref,
				display_name,
				avatar_ref,
			} => {
				let channel_id = channel_id.unwrap_or_else(ChannelId::fallback);
				let draft = match draft_from_wire(kind, body, media_ref) {
					Ok(draft) => draft,
					Err(e) => {
						self.send_error(outbound, ErrorCode::BadRequest, &e.to_string()).await;
						return;
					}
				};

				match self.dispatcher.publish(conn, channel_id, draft, display_name, avatar_ref).await {
					Ok(_) => {}
					Err(PublishError::InvalidDraft(e)) => {
						self.send_error(outbound, ErrorCode::BadRequest, &e.to_string()).await;
					}
					Err(PublishError::Unauthenticated) => {
						self.send_error(outbound, ErrorCode::Unauthenticated, "not registered").await;
					}
					Err(PublishError::Denied(e)) => {
						let code = match e {
							JoinError::UnknownChannel(_) => ErrorCode::NotFound,
							JoinError::NotAMember { .. } => ErrorCode::AuthorizationDenied,
						};
						self.send_error(outbound, code, &e.to_string()).await;
					}
					Err(PublishError::Store(e)) => {
						warn!(?conn, error = %e, "message persist failed");
						self.send_error(outbound, ErrorCode::StoreFailure, "could not persist message").await;
					}
				}
			}
		}
	}
}

/// Accepts websocket connections forever, spawning one task per peer.
pub async fn run_gateway(listener: tokio::net::TcpListener, gateway: Arc<Gateway>) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = listener.accept().await?;
		let gateway = gateway.clone();
		tokio::spawn(async move {
			gateway.handle_connection(stream, peer).await;
		});
	}
}
