#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use confab_domain::ChannelId;
use confab_protocol::{ClientEvent, ErrorCode, SendKind, ServerEvent, decode_server_event, encode_event};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Server websocket URL (`ws://host:port`).
	pub url: String,

	/// Access token presented during the handshake.
	pub token: String,

	/// Reconnect attempts before the session gives up.
	pub max_reconnect_attempts: u32,

	/// Delay between reconnect attempts.
	pub reconnect_delay: Duration,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,

	/// Capacity of the notice queue handed to the caller.
	pub notice_queue_depth: usize,
}

impl SessionConfig {
	pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			token: token.into(),
			max_reconnect_attempts: 5,
			reconnect_delay: Duration::from_secs(1),
			connect_timeout: Duration::from_secs(15),
			notice_queue_depth: 256,
		}
	}
}

/// Errors for client session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
	/// The session task has exited; no more commands will be accepted.
	#[error("session is closed")]
	Closed,
}

/// Observable session lifecycle, reported through [`SessionNotice::StateChanged`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	/// First connection attempt in progress.
	Connecting,
	/// Transport is up; waiting for the server to accept the token.
	Authenticating,
	/// Authenticated; subscriptions re-established.
	Ready,
	/// Connection lost; attempt `attempt` of the configured maximum.
	Reconnecting { attempt: u32 },
	/// Terminal failure. The session will not reconnect.
	Failed { reason: String },
	/// Clean shutdown requested by the caller.
	Closed,
}

/// Everything the session reports back to the caller.
#[derive(Debug, Clone)]
pub enum SessionNotice {
	StateChanged(SessionState),
	Welcome {
		subject_id: confab_domain::SubjectId,
		server_time_unix_ms: i64,
	},
	Message(confab_domain::Message),
	ServerError {
		code: ErrorCode,
		reason: String,
	},
}

#[derive(Debug)]
enum Command {
	Join(ChannelId),
	Leave(ChannelId),
	Send {
		channel_id: Option<ChannelId>,
		body: String,
		kind: SendKind,
		media_ref: Option<String>,
	},
	UpdateToken(String),
	Shutdown,
}

/// Handle for steering a running session. Cheap to clone; all clones feed
/// the same session task.
#[derive(Clone)]
pub struct SessionHandle {
	commands: mpsc::Sender<Command>,
}

impl SessionHandle {
	/// Subscribe to a channel. The subscription is remembered and re-sent
	/// after every reconnect.
	pub async fn join(&self, channel_id: ChannelId) -> Result<(), SessionError> {
		self.send_command(Command::Join(channel_id)).await
	}

	pub async fn leave(&self, channel_id: ChannelId) -> Result<(), SessionError> {
		self.send_command(Command::Leave(channel_id)).await
	}

	/// Send a text message. `None` lets the server pick the fallback channel.
	pub async fn send_text(&self, channel_id: Option<ChannelId>, body: impl Into<String>) -> Result<(), SessionError> {
		self.send_command(Command::Send {
			channel_id,
			body: body.into(),
			kind: SendKind::Text,
			media_ref: None,
		})
		.await
	}

	pub async fn send_image(
		&self,
		channel_id: Option<ChannelId>,
		caption: impl Into<String>,
		media_ref: impl Into<String>,
	) -> Result<(), SessionError> {
		self.send_command(Command::Send {
			channel_id,
			body: caption.into(),
			kind: SendKind::Image,
			media_ref: Some(media_ref.into()),
		})
		.await
	}

	/// Replace the access token. Applies to future reconnects; the current
	/// connection keeps its already-verified identity.
	pub async fn update_token(&self, token: impl Into<String>) -> Result<(), SessionError> {
		self.send_command(Command::UpdateToken(token.into())).await
	}

	pub async fn shutdown(&self) -> Result<(), SessionError> {
		self.send_command(Command::Shutdown).await
	}

	async fn send_command(&self, command: Command) -> Result<(), SessionError> {
		self.commands.send(command).await.map_err(|_| SessionError::Closed)
	}
}

/// Spawn a managed session. The returned receiver yields state changes,
/// delivered messages, and server errors until the session ends.
pub fn spawn(config: SessionConfig) -> (SessionHandle, mpsc::Receiver<SessionNotice>) {
	let (command_tx, command_rx) = mpsc::channel(64);
	let (notice_tx, notice_rx) = mpsc::channel(config.notice_queue_depth.max(1));

	tokio::spawn(run_session(config, command_rx, notice_tx));

	(SessionHandle { commands: command_tx }, notice_rx)
}

enum HandshakeFailure {
	/// The server rejected the token. Retrying with the same token is
	/// pointless, so this ends the session.
	Rejected(String),
	/// Transport-level failure; worth retrying.
	Transport(String),
}

struct SessionTask {
	config: SessionConfig,
	token: String,
	channels: HashSet<ChannelId>,
	notices: mpsc::Sender<SessionNotice>,
}

impl SessionTask {
	async fn notify(&self, notice: SessionNotice) {
		let _ = self.notices.send(notice).await;
	}

	async fn connect_and_auth(&self) -> Result<Ws, HandshakeFailure> {
		let connect = timeout(self.config.connect_timeout, connect_async(&self.config.url));
		let (mut ws, _) = match connect.await {
			Ok(Ok(pair)) => pair,
			Ok(Err(e)) => return Err(HandshakeFailure::Transport(format!("connect failed: {e}"))),
			Err(_) => {
				return Err(HandshakeFailure::Transport(format!(
					"connect timeout after {:?}",
					self.config.connect_timeout
				)));
			}
		};

		self.notify(SessionNotice::StateChanged(SessionState::Authenticating)).await;
		let auth = ClientEvent::Auth {
			token: self.token.clone(),
		};
		let frame = encode_event(&auth).map_err(|e| HandshakeFailure::Transport(format!("encode auth: {e}")))?;
		ws.send(WsMessage::text(frame))
			.await
			.map_err(|e| HandshakeFailure::Transport(format!("send auth: {e}")))?;

		let first = timeout(self.config.connect_timeout, next_server_event(&mut ws))
			.await
			.map_err(|_| HandshakeFailure::Transport("timeout waiting for welcome".to_string()))?;

		match first {
			Ok(ServerEvent::Welcome {
				subject_id,
				server_time_unix_ms,
			}) => {
				info!(subject = %subject_id, "session authenticated");
				self.notify(SessionNotice::Welcome {
					subject_id,
					server_time_unix_ms,
				})
				.await;
				Ok(ws)
			}
			Ok(ServerEvent::Error { code, reason }) if code == ErrorCode::Unauthenticated => {
				Err(HandshakeFailure::Rejected(reason))
			}
			Ok(other) => Err(HandshakeFailure::Transport(format!("expected welcome, got {other:?}"))),
			Err(e) => Err(HandshakeFailure::Transport(e)),
		}
	}

	async fn resubscribe(&self, ws: &mut Ws) -> Result<(), String> {
		for channel_id in &self.channels {
			send_event(ws, &ClientEvent::JoinChannel {
				channel_id: channel_id.clone(),
			})
			.await?;
		}
		Ok(())
	}

	/// Applies a command to the live connection. Returns false on shutdown.
	async fn apply_command(&mut self, ws: &mut Ws, command: Command) -> Result<bool, String> {
		match command {
			Command::Join(channel_id) => {
				if self.channels.insert(channel_id.clone()) {
					send_event(ws, &ClientEvent::JoinChannel { channel_id }).await?;
				}
			}
			Command::Leave(channel_id) => {
				if self.channels.remove(&channel_id) {
					send_event(ws, &ClientEvent::LeaveChannel { channel_id }).await?;
				}
			}
			Command::Send {
				channel_id,
				body,
				kind,
				media_ref,
			} => {
				send_event(ws, &ClientEvent::SendMessage {
					channel_id,
					body,
					kind,
					media_ref,
					display_name: None,
					avatar_ref: None,
				})
				.await?;
			}
			Command::UpdateToken(token) => {
				debug!("token updated; applies on next reconnect");
				self.token = token;
			}
			Command::Shutdown => return Ok(false),
		}
		Ok(true)
	}

	/// Remembers desired state while disconnected. Returns false on shutdown.
	fn apply_command_offline(&mut self, command: Command) -> bool {
		match command {
			Command::Join(channel_id) => {
				self.channels.insert(channel_id);
			}
			Command::Leave(channel_id) => {
				self.channels.remove(&channel_id);
			}
			Command::Send { .. } => {
				debug!("dropping send while disconnected");
			}
			Command::UpdateToken(token) => {
				self.token = token;
			}
			Command::Shutdown => return false,
		}
		true
	}

	/// Pumps the live connection until it drops or the caller shuts down.
	/// Returns true if the session should reconnect.
	async fn run_connected(&mut self, ws: &mut Ws, commands: &mut mpsc::Receiver<Command>) -> bool {
		loop {
			tokio::select! {
				command = commands.recv() => {
					let Some(command) = command else {
						// every handle dropped: nothing can steer the session anymore
						return false;
					};
					match self.apply_command(ws, command).await {
						Ok(true) => {}
						Ok(false) => return false,
						Err(e) => {
							warn!(error = %e, "send failed; reconnecting");
							return true;
						}
					}
				}
				frame = ws.next() => {
					let Some(frame) = frame else {
						warn!("server closed the connection");
						return true;
					};
					let frame = match frame {
						Ok(frame) => frame,
						Err(e) => {
							warn!(error = %e, "websocket error; reconnecting");
							return true;
						}
					};
					let text = match frame {
						WsMessage::Text(text) => text,
						WsMessage::Close(_) => return true,
						_ => continue,
					};
					match decode_server_event(text.as_ref()) {
						Ok(ServerEvent::ReceiveMessage { message }) => {
							self.notify(SessionNotice::Message(message)).await;
						}
						Ok(ServerEvent::Error { code, reason }) => {
							self.notify(SessionNotice::ServerError { code, reason }).await;
						}
						Ok(ServerEvent::Welcome { .. }) => {
							debug!("ignoring duplicate welcome");
						}
						Err(e) => {
							warn!(error = %e, "undecodable server frame");
						}
					}
				}
			}
		}
	}
}

async fn run_session(config: SessionConfig, mut commands: mpsc::Receiver<Command>, notices: mpsc::Sender<SessionNotice>) {
	let mut task = SessionTask {
		token: config.token.clone(),
		config,
		channels: HashSet::new(),
		notices,
	};

	let mut attempt: u32 = 0;
	task.notify(SessionNotice::StateChanged(SessionState::Connecting)).await;

	loop {
		// Apply anything queued while disconnected before dialing, so a
		// token swap or shutdown does not race the connect.
		while let Ok(command) = commands.try_recv() {
			if !task.apply_command_offline(command) {
				task.notify(SessionNotice::StateChanged(SessionState::Closed)).await;
				return;
			}
		}

		match task.connect_and_auth().await {
			Ok(mut ws) => {
				attempt = 0;
				if let Err(e) = task.resubscribe(&mut ws).await {
					warn!(error = %e, "resubscribe failed; reconnecting");
				} else {
					task.notify(SessionNotice::StateChanged(SessionState::Ready)).await;
					let reconnect = task.run_connected(&mut ws, &mut commands).await;
					let _ = ws.close(None).await;
					if !reconnect {
						task.notify(SessionNotice::StateChanged(SessionState::Closed)).await;
						return;
					}
				}
			}
			Err(HandshakeFailure::Rejected(reason)) => {
				warn!(%reason, "handshake rejected; giving up");
				task.notify(SessionNotice::StateChanged(SessionState::Failed {
					reason: format!("handshake rejected: {reason}"),
				}))
				.await;
				return;
			}
			Err(HandshakeFailure::Transport(reason)) => {
				debug!(%reason, "connection attempt failed");
			}
		}

		attempt += 1;
		if attempt > task.config.max_reconnect_attempts {
			task.notify(SessionNotice::StateChanged(SessionState::Failed {
				reason: format!("gave up after {} reconnect attempts", task.config.max_reconnect_attempts),
			}))
			.await;
			return;
		}

		task.notify(SessionNotice::StateChanged(SessionState::Reconnecting { attempt })).await;
		sleep(task.config.reconnect_delay).await;
	}
}

async fn send_event(ws: &mut Ws, event: &ClientEvent) -> Result<(), String> {
	let frame = encode_event(event).map_err(|e| format!("encode: {e}"))?;
	ws.send(WsMessage::text(frame)).await.map_err(|e| format!("send: {e}"))
}

async fn next_server_event(ws: &mut Ws) -> Result<ServerEvent, String> {
	loop {
		let frame = ws
			.next()
			.await
			.ok_or_else(|| "stream closed before receiving an event".to_string())?
			.map_err(|e| format!("websocket error: {e}"))?;
		match frame {
			WsMessage::Text(text) => {
				return decode_server_event(text.as_ref()).map_err(|e| format!("decode: {e}"));
			}
			WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
			WsMessage::Close(_) => return Err("closed during handshake".to_string()),
			other => return Err(format!("unexpected frame during handshake: {other:?}")),
		}
	}
}
