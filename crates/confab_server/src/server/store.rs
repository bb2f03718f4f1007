#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use confab_domain::{ChannelId, Message, MessageDraft, MessageId, MessageKind, SubjectId};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::Mutex;

use crate::util::time::MonotonicMillis;

pub const DEFAULT_QUERY_LIMIT: u32 = 50;
pub const MAX_QUERY_LIMIT: u32 = 200;

/// Clamps a client-supplied page size to `1..=MAX_QUERY_LIMIT`, applying
/// the default when absent.
pub fn clamp_limit(requested: Option<u32>) -> u32 {
	requested.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
}

/// A message that has passed validation and identity resolution but has
/// not yet been assigned an id or timestamp by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub channel_id: ChannelId,
	pub author_id: SubjectId,
	pub author_display_name: String,
	pub author_avatar_ref: Option<String>,
	pub draft: MessageDraft,
}

/// Durable, append-only record of channel messages. Implementations must
/// assign non-decreasing `created_at` timestamps and query newest-first.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persists the message, assigning its id and timestamp. Returns the
	/// stored record exactly as later queries will see it.
	async fn append(&self, new: NewMessage) -> anyhow::Result<Message>;

	/// Returns up to `limit` messages for `channel_id`, newest first.
	/// When `before_unix_ms` is set, only messages strictly older than
	/// that instant are returned.
	async fn query_page(&self, channel_id: &ChannelId, before_unix_ms: Option<i64>, limit: u32) -> anyhow::Result<Vec<Message>>;
}

/// In-process store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryMessageStore {
	clock: MonotonicMillis,
	messages: Mutex<Vec<Message>>,
}

impl MemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
	async fn append(&self, new: NewMessage) -> anyhow::Result<Message> {
		// Stamp the timestamp under the same lock that fixes insertion
		// order; otherwise two concurrent appends could land in the Vec in
		// the opposite order of their timestamps.
		let mut messages = self.messages.lock().await;
		let message = Message {
			id: MessageId::new_v4(),
			channel_id: new.channel_id,
			author_id: new.author_id,
			author_display_name: new.author_display_name,
			author_avatar_ref: new.author_avatar_ref,
			body: new.draft.body,
			kind: new.draft.kind,
			created_at_unix_ms: self.clock.now(),
		};
		messages.push(message.clone());
		Ok(message)
	}

	async fn query_page(&self, channel_id: &ChannelId, before_unix_ms: Option<i64>, limit: u32) -> anyhow::Result<Vec<Message>> {
		let messages = self.messages.lock().await;
		let mut page: Vec<Message> = messages
			.iter()
			.filter(|m| &m.channel_id == channel_id)
			.filter(|m| before_unix_ms.is_none_or(|cutoff| m.created_at_unix_ms < cutoff))
			.cloned()
			.collect();
		// Append order is insertion order, so reversing yields newest first.
		page.reverse();
		page.truncate(limit as usize);
		Ok(page)
	}
}

/// SQLite-backed store. Schema lives in `migrations/sqlite/` and is
/// applied on open.
pub struct SqliteMessageStore {
	pool: SqlitePool,
	clock: MonotonicMillis,
}

impl SqliteMessageStore {
	pub async fn open(database_url: &str) -> anyhow::Result<Self> {
		let options = SqliteConnectOptions::from_str(database_url)
			.with_context(|| format!("parse sqlite url {database_url:?}"))?
			.create_if_missing(true);

		// An in-memory database exists per connection; pin the pool to a
		// single connection so the schema and data are actually shared.
		let mut pool_options = SqlitePoolOptions::new();
		if database_url.contains(":memory:") {
			pool_options = pool_options.min_connections(1).max_connections(1);
		}

		let pool = pool_options.connect_with(options).await.context("open sqlite pool")?;
		sqlx::migrate!("./migrations/sqlite").run(&pool).await.context("run sqlite migrations")?;

		Ok(Self {
			pool,
			clock: MonotonicMillis::default(),
		})
	}

	pub async fn open_file(path: &Path) -> anyhow::Result<Self> {
		let url = format!("sqlite://{}", path.display());
		Self::open(&url).await
	}
}

fn row_to_message(row: SqliteRow) -> anyhow::Result<Message> {
	let id: String = row.try_get("id")?;
	let channel_id: String = row.try_get("channel_id")?;
	let author_id: String = row.try_get("author_id")?;
	let kind: String = row.try_get("kind")?;
	let media_ref: Option<String> = row.try_get("media_ref")?;

	let kind = match kind.as_str() {
		"text" => MessageKind::Text,
		"system" => MessageKind::System,
		"image" => MessageKind::Image {
			media_ref: media_ref.context("image row missing media_ref")?,
		},
		other => anyhow::bail!("unknown message kind {other:?} in store"),
	};

	Ok(Message {
		id: MessageId(id.parse().context("parse message id")?),
		channel_id: channel_id.parse().context("parse channel id")?,
		author_id: author_id.parse().context("parse author id")?,
		author_display_name: row.try_get("author_display_name")?,
		author_avatar_ref: row.try_get("author_avatar_ref")?,
		body: row.try_get("body")?,
		kind,
		created_at_unix_ms: row.try_get("created_at")?,
	})
}

#[async_trait::async_trait]
impl MessageStore for SqliteMessageStore {
	async fn append(&self, new: NewMessage) -> anyhow::Result<Message> {
		let message = Message {
			id: MessageId::new_v4(),
			channel_id: new.channel_id,
			author_id: new.author_id,
			author_display_name: new.author_display_name,
			author_avatar_ref: new.author_avatar_ref,
			body: new.draft.body,
			kind: new.draft.kind,
			created_at_unix_ms: self.clock.now(),
		};

		let media_ref = match &message.kind {
			MessageKind::Image { media_ref } => Some(media_ref.as_str()),
			_ => None,
		};

		sqlx::query(
			"INSERT INTO messages (id, channel_id, author_id, author_display_name, author_avatar_ref, body, kind, media_ref, created_at)
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
		)
		.bind(message.id.0.to_string())
		.bind(message.channel_id.as_str())
		.bind(message.author_id.as_str())
		.bind(&message.author_display_name)
		.bind(&message.author_avatar_ref)
		.bind(&message.body)
		.bind(message.kind.name())
		.bind(media_ref)
		.bind(message.created_at_unix_ms)
		.execute(&self.pool)
		.await
		.context("insert message")?;

		Ok(message)
	}

	async fn query_page(&self, channel_id: &ChannelId, before_unix_ms: Option<i64>, limit: u32) -> anyhow::Result<Vec<Message>> {
		let rows = match before_unix_ms {
			Some(cutoff) => {
				sqlx::query(
					"SELECT id, channel_id, author_id, author_display_name, author_avatar_ref, body, kind, media_ref, created_at
					 FROM messages WHERE channel_id = ? AND created_at < ?
					 ORDER BY created_at DESC, seq DESC LIMIT ?",
				)
				.bind(channel_id.as_str())
				.bind(cutoff)
				.bind(limit)
				.fetch_all(&self.pool)
				.await
			}
			None => {
				sqlx::query(
					"SELECT id, channel_id, author_id, author_display_name, author_avatar_ref, body, kind, media_ref, created_at
					 FROM messages WHERE channel_id = ?
					 ORDER BY created_at DESC, seq DESC LIMIT ?",
				)
				.bind(channel_id.as_str())
				.bind(limit)
				.fetch_all(&self.pool)
				.await
			}
		}
		.context("query message page")?;

		rows.into_iter().map(row_to_message).collect()
	}
}

pub type SharedStore = Arc<dyn MessageStore>;
