#![forbid(unsafe_code)]

//! Wire protocol for the live connection: JSON text frames over one
//! websocket per logical session. Auth is carried once at handshake time,
//! never per-event.

use core::fmt;

use confab_domain::{ChannelId, Message, SubjectId};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum JSON frame size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json codec error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Message kind as sent on the wire. The server validates the combination
/// of kind and media ref at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
	#[default]
	Text,
	Image,
	System,
}

/// Client to server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
	/// Must be the first frame on every connection. Anything else sent
	/// before authentication is rejected and the connection is closed.
	Auth {
		token: String,
	},

	/// Idempotent channel subscription.
	JoinChannel {
		channel_id: ChannelId,
	},

	LeaveChannel {
		channel_id: ChannelId,
	},

	/// Fire-and-forget publish. A missing channel falls back to `general`.
	/// Display fields are used only when the bound identity lacks them.
	SendMessage {
		#[serde(default)]
		channel_id: Option<ChannelId>,
		body: String,
		#[serde(default)]
		kind: SendKind,
		#[serde(default)]
		media_ref: Option<String>,
		#[serde(default)]
		display_name: Option<String>,
		#[serde(default)]
		avatar_ref: Option<String>,
	},
}

/// Server to client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
	/// Handshake success acknowledgement.
	Welcome {
		subject_id: SubjectId,
		server_time_unix_ms: i64,
	},

	/// Fan-out delivery, including the sender's own echo.
	ReceiveMessage {
		message: Message,
	},

	Error {
		code: ErrorCode,
		reason: String,
	},
}

impl ServerEvent {
	pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
		ServerEvent::Error {
			code,
			reason: reason.into(),
		}
	}
}

/// Error taxonomy carried on `error` events and HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	Unauthenticated,
	AuthorizationDenied,
	NotFound,
	StoreFailure,
	BadRequest,
	ServerError,
}

impl ErrorCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorCode::Unauthenticated => "unauthenticated",
			ErrorCode::AuthorizationDenied => "authorization_denied",
			ErrorCode::NotFound => "not_found",
			ErrorCode::StoreFailure => "store_failure",
			ErrorCode::BadRequest => "bad_request",
			ErrorCode::ServerError => "server_error",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Encode an event into a single JSON text frame, capped at
/// [`DEFAULT_MAX_FRAME_SIZE`].
pub fn encode_event<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
	encode_event_with_limit(event, DEFAULT_MAX_FRAME_SIZE)
}

/// Encode with an explicit frame size cap.
pub fn encode_event_with_limit<T: Serialize>(event: &T, max_frame_size: usize) -> Result<String, ProtocolError> {
	let frame = serde_json::to_string(event)?;
	if frame.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: frame.len(),
			max: max_frame_size,
		});
	}
	Ok(frame)
}

fn decode_event<T: DeserializeOwned>(frame: &str, max_frame_size: usize) -> Result<T, ProtocolError> {
	if frame.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: frame.len(),
			max: max_frame_size,
		});
	}
	Ok(serde_json::from_str(frame)?)
}

/// Decode a single client event frame, capped at [`DEFAULT_MAX_FRAME_SIZE`].
pub fn decode_client_event(frame: &str) -> Result<ClientEvent, ProtocolError> {
	decode_event(frame, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a client event with an explicit frame size cap.
pub fn decode_client_event_with_limit(frame: &str, max_frame_size: usize) -> Result<ClientEvent, ProtocolError> {
	decode_event(frame, max_frame_size)
}

/// Decode a single server event frame, capped at [`DEFAULT_MAX_FRAME_SIZE`].
pub fn decode_server_event(frame: &str) -> Result<ServerEvent, ProtocolError> {
	decode_event(frame, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a server event with an explicit frame size cap.
pub fn decode_server_event_with_limit(frame: &str, max_frame_size: usize) -> Result<ServerEvent, ProtocolError> {
	decode_event(frame, max_frame_size)
}
