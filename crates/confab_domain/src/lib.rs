#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Errors for constructing a message draft.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DraftError {
	#[error("message body must not be empty")]
	EmptyBody,
	#[error("image messages require a media ref")]
	MissingMediaRef,
}

/// Authenticated subject identifier, stable across connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
	/// Create a non-empty `SubjectId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for SubjectId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for SubjectId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		SubjectId::new(s.to_string())
	}
}

/// Channel identifier inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	/// Well-known fallback channel used by legacy write paths that omit the channel.
	pub const FALLBACK_NAME: &'static str = "general";

	/// Create a non-empty `ChannelId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// The well-known fallback channel (`general`).
	pub fn fallback() -> Self {
		Self(Self::FALLBACK_NAME.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::new(s.to_string())
	}
}

/// Room identifier. Rooms own channels and membership; the messaging core
/// only ever reads them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Store-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Message kind. The variant selects which associated fields are required:
/// only image messages carry a media ref, checked at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
	Text,
	Image { media_ref: String },
	System,
}

impl MessageKind {
	/// Stable kind name as stored and logged.
	pub fn name(&self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::Image { .. } => "image",
			MessageKind::System => "system",
		}
	}
}

/// Validated message content prior to persistence. Author and channel are
/// stamped by the dispatcher, id and timestamp by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
	pub body: String,
	pub kind: MessageKind,
}

impl MessageDraft {
	/// A plain text message. The body must be non-empty.
	pub fn text(body: impl Into<String>) -> Result<Self, DraftError> {
		let body = body.into();
		if body.trim().is_empty() {
			return Err(DraftError::EmptyBody);
		}
		Ok(Self {
			body,
			kind: MessageKind::Text,
		})
	}

	/// An image message. The media ref must be non-empty; the body is an
	/// optional caption and may be empty.
	pub fn image(media_ref: impl Into<String>, caption: impl Into<String>) -> Result<Self, DraftError> {
		let media_ref = media_ref.into();
		if media_ref.trim().is_empty() {
			return Err(DraftError::MissingMediaRef);
		}
		Ok(Self {
			body: caption.into(),
			kind: MessageKind::Image { media_ref },
		})
	}

	/// A server-generated system message.
	pub fn system(body: impl Into<String>) -> Result<Self, DraftError> {
		let body = body.into();
		if body.trim().is_empty() {
			return Err(DraftError::EmptyBody);
		}
		Ok(Self {
			body,
			kind: MessageKind::System,
		})
	}
}

/// Authenticated identity resolved from a token, bound once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub subject_id: SubjectId,
	pub display_name: Option<String>,
	pub avatar_ref: Option<String>,
}

impl Identity {
	/// Display name used when neither the token nor the client supplies one.
	pub const DEFAULT_DISPLAY_NAME: &'static str = "User";

	pub fn new(subject_id: SubjectId) -> Self {
		Self {
			subject_id,
			display_name: None,
			avatar_ref: None,
		}
	}

	/// Resolve the display name to stamp on a message. The token claim wins;
	/// a client-supplied value is a fallback only when the claim is absent.
	pub fn resolve_display_name(&self, client_fallback: Option<&str>) -> String {
		self.display_name
			.as_deref()
			.or(client_fallback)
			.filter(|s| !s.trim().is_empty())
			.unwrap_or(Self::DEFAULT_DISPLAY_NAME)
			.to_string()
	}

	/// Resolve the avatar ref to stamp on a message, same precedence as the
	/// display name.
	pub fn resolve_avatar_ref(&self, client_fallback: Option<&str>) -> Option<String> {
		self.avatar_ref
			.as_deref()
			.or(client_fallback)
			.filter(|s| !s.trim().is_empty())
			.map(|s| s.to_string())
	}
}

/// A persisted message. Immutable once created; `created_at_unix_ms` is
/// server-assigned and authoritative for per-channel ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub channel_id: ChannelId,
	pub author_id: SubjectId,
	pub author_display_name: String,
	pub author_avatar_ref: Option<String>,
	pub body: String,
	#[serde(flatten)]
	pub kind: MessageKind,
	pub created_at_unix_ms: i64,
}

/// Channel kind. Voice channels exist in the directory but carry no messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
	Text,
	Voice,
}

/// Read-only channel reference owned by the room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
	pub id: ChannelId,
	pub name: String,
	pub kind: ChannelKind,
}

/// Read-only room reference: ordered channels plus membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub channels: Vec<Channel>,
	pub members: Vec<SubjectId>,
}
