#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use confab_domain::{ChannelId, Identity};
use confab_protocol::ServerEvent;
use tokio::sync::{Mutex, mpsc};

/// Opaque handle for one live connection. Issued by [`SubscriptionRegistry::register`]
/// and unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

struct ConnEntry {
	identity: Identity,
	outbound: mpsc::Sender<ServerEvent>,
	channels: HashSet<ChannelId>,
}

#[derive(Default)]
struct Inner {
	conns: HashMap<ConnId, ConnEntry>,
	conns_by_channel: HashMap<ChannelId, HashSet<ConnId>>,
}

/// Tracks which authenticated connections are subscribed to which channels.
///
/// A connection must [`register`](Self::register) once after its handshake,
/// then [`join`](Self::join) each channel it wants delivery for. Fan-out
/// reads through [`subscribers_of`](Self::subscribers_of); senders whose
/// receiving half is gone are pruned there rather than on disconnect alone,
/// so an abrupt socket death never wedges a channel.
#[derive(Default)]
pub struct SubscriptionRegistry {
	next_id: AtomicU64,
	inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn register(&self, identity: Identity, outbound: mpsc::Sender<ServerEvent>) -> ConnId {
		let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let mut inner = self.inner.lock().await;
		inner.conns.insert(
			id,
			ConnEntry {
				identity,
				outbound,
				channels: HashSet::new(),
			},
		);
		id
	}

	/// Subscribes `conn` to `channel`. Idempotent; joining a channel the
	/// connection is already in is a no-op and reported as such.
	pub async fn join(&self, conn: ConnId, channel: &ChannelId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.get_mut(&conn) else {
			return false;
		};
		if !entry.channels.insert(channel.clone()) {
			return false;
		}
		inner.conns_by_channel.entry(channel.clone()).or_default().insert(conn);
		true
	}

	pub async fn leave(&self, conn: ConnId, channel: &ChannelId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.get_mut(&conn) else {
			return false;
		};
		if !entry.channels.remove(channel) {
			return false;
		}
		if let Some(set) = inner.conns_by_channel.get_mut(channel) {
			set.remove(&conn);
			if set.is_empty() {
				inner.conns_by_channel.remove(channel);
			}
		}
		true
	}

	/// Removes the connection and all of its subscriptions. Safe to call
	/// on an id that has already been unregistered.
	pub async fn unregister(&self, conn: ConnId) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.conns.remove(&conn) else {
			return;
		};
		for channel in entry.channels {
			if let Some(set) = inner.conns_by_channel.get_mut(&channel) {
				set.remove(&conn);
				if set.is_empty() {
					inner.conns_by_channel.remove(&channel);
				}
			}
		}
	}

	/// Returns the outbound senders of every live subscriber of `channel`,
	/// pruning entries whose connection has gone away.
	pub async fn subscribers_of(&self, channel: &ChannelId) -> Vec<(ConnId, mpsc::Sender<ServerEvent>)> {
		let mut inner = self.inner.lock().await;
		let Some(ids) = inner.conns_by_channel.get(channel) else {
			return Vec::new();
		};

		let mut live = Vec::with_capacity(ids.len());
		let mut dead = Vec::new();
		for id in ids {
			match inner.conns.get(id) {
				Some(entry) if !entry.outbound.is_closed() => live.push((*id, entry.outbound.clone())),
				_ => dead.push(*id),
			}
		}

		for id in dead {
			if let Some(entry) = inner.conns.remove(&id) {
				for ch in entry.channels {
					if let Some(set) = inner.conns_by_channel.get_mut(&ch) {
						set.remove(&id);
						if set.is_empty() {
							inner.conns_by_channel.remove(&ch);
						}
					}
				}
			} else if let Some(set) = inner.conns_by_channel.get_mut(channel) {
				set.remove(&id);
			}
		}

		live
	}

	pub async fn identity_of(&self, conn: ConnId) -> Option<Identity> {
		let inner = self.inner.lock().await;
		inner.conns.get(&conn).map(|e| e.identity.clone())
	}

	pub async fn channels_of(&self, conn: ConnId) -> Vec<ChannelId> {
		let inner = self.inner.lock().await;
		inner
			.conns
			.get(&conn)
			.map(|e| e.channels.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub async fn subscriber_count(&self, channel: &ChannelId) -> usize {
		let inner = self.inner.lock().await;
		inner.conns_by_channel.get(channel).map(|s| s.len()).unwrap_or(0)
	}
}

pub type SharedRegistry = Arc<SubscriptionRegistry>;
