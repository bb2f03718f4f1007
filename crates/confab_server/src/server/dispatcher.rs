#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use confab_domain::{ChannelId, DraftError, Identity, Message, MessageDraft};
use confab_protocol::{SendKind, ServerEvent};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::directory::{JoinError, RoomDirectory, authorize_join};
use super::registry::{ConnId, SubscriptionRegistry};
use super::store::{MessageStore, NewMessage};

#[derive(Debug, Error)]
pub enum PublishError {
	#[error("invalid message: {0}")]
	InvalidDraft(#[from] DraftError),

	#[error("connection is not authenticated")]
	Unauthenticated,

	#[error(transparent)]
	Denied(#[from] JoinError),

	#[error("persist failed: {0}")]
	Store(#[source] anyhow::Error),
}

/// Builds a validated draft from wire-level send fields.
pub fn draft_from_wire(kind: SendKind, body: String, media_ref: Option<String>) -> Result<MessageDraft, DraftError> {
	match kind {
		SendKind::Text => MessageDraft::text(body),
		SendKind::System => MessageDraft::system(body),
		SendKind::Image => MessageDraft::image(media_ref.unwrap_or_default(), body),
	}
}

/// Persists messages and fans them out to channel subscribers.
///
/// Publishes are gated by the room directory: the same membership check
/// that guards joins applies to writes, whichever path they arrive on.
/// The append and the fan-out happen under a per-channel lock, so two
/// messages to the same channel are always observed by every subscriber
/// in store order. Messages to different channels do not contend.
/// Delivery to an individual subscriber is best-effort; a full or closed
/// outbound queue drops the event for that subscriber only.
pub struct BroadcastDispatcher {
	registry: Arc<SubscriptionRegistry>,
	store: Arc<dyn MessageStore>,
	directory: Arc<dyn RoomDirectory>,
	channel_locks: Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>,
}

impl BroadcastDispatcher {
	pub fn new(registry: Arc<SubscriptionRegistry>, store: Arc<dyn MessageStore>, directory: Arc<dyn RoomDirectory>) -> Self {
		Self {
			registry,
			store,
			directory,
			channel_locks: Mutex::new(HashMap::new()),
		}
	}

	pub fn store(&self) -> &Arc<dyn MessageStore> {
		&self.store
	}

	async fn lock_for(&self, channel: &ChannelId) -> Arc<Mutex<()>> {
		let mut locks = self.channel_locks.lock().await;
		locks.entry(channel.clone()).or_default().clone()
	}

	/// Drop per-channel locks nobody is holding anymore, so the map does
	/// not grow with every channel ever published to.
	async fn prune_locks(&self) {
		let mut locks = self.channel_locks.lock().await;
		locks.retain(|_, lock| Arc::strong_count(lock) > 1);
	}

	#[cfg(test)]
	pub(crate) async fn channel_lock_count(&self) -> usize {
		self.channel_locks.lock().await.len()
	}

	/// Publishes a message from a registered connection. The author's
	/// identity is looked up in the registry; unknown connections are
	/// rejected.
	pub async fn publish(&self, from: ConnId, channel_id: ChannelId, draft: MessageDraft, wire_display_name: Option<String>, wire_avatar_ref: Option<String>) -> Result<Message, PublishError> {
		let Some(identity) = self.registry.identity_of(from).await else {
			return Err(PublishError::Unauthenticated);
		};
		self.publish_as(&identity, channel_id, draft, wire_display_name, wire_avatar_ref).await
	}

	/// Publishes a message on behalf of an already-verified identity.
	/// Used by the HTTP ingest path, where there is no connection.
	pub async fn publish_as(&self, identity: &Identity, channel_id: ChannelId, draft: MessageDraft, wire_display_name: Option<String>, wire_avatar_ref: Option<String>) -> Result<Message, PublishError> {
		authorize_join(self.directory.as_ref(), &identity.subject_id, &channel_id).await?;

		let new = NewMessage {
			channel_id: channel_id.clone(),
			author_id: identity.subject_id.clone(),
			author_display_name: identity.resolve_display_name(wire_display_name.as_deref()),
			author_avatar_ref: identity.resolve_avatar_ref(wire_avatar_ref.as_deref()),
			draft,
		};

		let channel_lock = self.lock_for(&channel_id).await;
		let result = {
			let _ordering = channel_lock.lock().await;
			match self.store.append(new).await {
				Ok(message) => {
					metrics::counter!("confab_messages_published").increment(1);
					self.fan_out(&message).await;
					Ok(message)
				}
				Err(e) => Err(PublishError::Store(e)),
			}
		};
		drop(channel_lock);
		self.prune_locks().await;
		result
	}

	async fn fan_out(&self, message: &Message) {
		let subscribers = self.registry.subscribers_of(&message.channel_id).await;
		debug!(
			channel = %message.channel_id,
			subscribers = subscribers.len(),
			"fanning out message"
		);

		for (conn, sender) in subscribers {
			let event = ServerEvent::ReceiveMessage {
				message: message.clone(),
			};
			if let Err(e) = sender.try_send(event) {
				warn!(?conn, error = %e, "dropping delivery to slow or closed subscriber");
				metrics::counter!("confab_deliveries_dropped").increment(1);
			} else {
				metrics::counter!("confab_deliveries_sent").increment(1);
			}
		}
	}
}
