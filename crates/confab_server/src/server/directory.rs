#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use confab_domain::{Channel, ChannelId, ChannelKind, Room, RoomId, SubjectId};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum JoinError {
	#[error("channel {0} does not exist")]
	UnknownChannel(ChannelId),

	#[error("subject {subject} is not a member of the room owning channel {channel}")]
	NotAMember { subject: SubjectId, channel: ChannelId },
}

/// Resolves channels to their owning room and answers membership queries.
/// Subscription requests are checked against this before the registry is
/// touched.
#[async_trait::async_trait]
pub trait RoomDirectory: Send + Sync {
	/// Returns the room that owns `channel`, or `None` for channels the
	/// directory does not know about.
	async fn room_of(&self, channel: &ChannelId) -> Option<Room>;

	/// The room's channels in directory order. Empty for unknown rooms.
	async fn list_channels(&self, room: &RoomId) -> Vec<Channel>;

	async fn is_member(&self, subject: &SubjectId, channel: &ChannelId) -> bool;
}

/// Checks that `subject` may subscribe to `channel` against the directory.
pub async fn authorize_join(directory: &dyn RoomDirectory, subject: &SubjectId, channel: &ChannelId) -> Result<(), JoinError> {
	if directory.room_of(channel).await.is_none() {
		return Err(JoinError::UnknownChannel(channel.clone()));
	}
	if !directory.is_member(subject, channel).await {
		return Err(JoinError::NotAMember {
			subject: subject.clone(),
			channel: channel.clone(),
		});
	}
	Ok(())
}

/// Directory in which every channel exists and every subject is a member.
/// Suitable for single-community deployments with no access control.
pub struct OpenDirectory {
	room_id: RoomId,
}

impl OpenDirectory {
	pub fn new() -> Self {
		Self {
			room_id: RoomId::new("public").unwrap_or_else(|_| unreachable!()),
		}
	}
}

impl Default for OpenDirectory {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl RoomDirectory for OpenDirectory {
	async fn room_of(&self, channel: &ChannelId) -> Option<Room> {
		Some(Room {
			id: self.room_id.clone(),
			channels: vec![Channel {
				id: channel.clone(),
				name: channel.as_str().to_string(),
				kind: ChannelKind::Text,
			}],
			members: Vec::new(),
		})
	}

	async fn list_channels(&self, _room: &RoomId) -> Vec<Channel> {
		vec![Channel {
			id: ChannelId::fallback(),
			name: ChannelId::FALLBACK_NAME.to_string(),
			kind: ChannelKind::Text,
		}]
	}

	async fn is_member(&self, _subject: &SubjectId, _channel: &ChannelId) -> bool {
		true
	}
}

/// Fixed channel-to-room mapping with explicit member lists. Membership
/// edits take effect for subsequent joins only.
#[derive(Default)]
pub struct StaticDirectory {
	inner: RwLock<StaticInner>,
}

#[derive(Default)]
struct StaticInner {
	rooms: HashMap<RoomId, Room>,
	room_by_channel: HashMap<ChannelId, RoomId>,
}

impl StaticDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert_room(&self, room: Room) {
		let mut inner = self.inner.write().await;
		for channel in &room.channels {
			inner.room_by_channel.insert(channel.id.clone(), room.id.clone());
		}
		inner.rooms.insert(room.id.clone(), room);
	}

	pub async fn add_member(&self, room_id: &RoomId, subject: SubjectId) {
		let mut inner = self.inner.write().await;
		if let Some(room) = inner.rooms.get_mut(room_id)
			&& !room.members.contains(&subject)
		{
			room.members.push(subject);
		}
	}
}

#[async_trait::async_trait]
impl RoomDirectory for StaticDirectory {
	async fn room_of(&self, channel: &ChannelId) -> Option<Room> {
		let inner = self.inner.read().await;
		let room_id = inner.room_by_channel.get(channel)?;
		inner.rooms.get(room_id).cloned()
	}

	async fn list_channels(&self, room: &RoomId) -> Vec<Channel> {
		let inner = self.inner.read().await;
		inner.rooms.get(room).map(|r| r.channels.clone()).unwrap_or_default()
	}

	async fn is_member(&self, subject: &SubjectId, channel: &ChannelId) -> bool {
		let inner = self.inner.read().await;
		let Some(room_id) = inner.room_by_channel.get(channel) else {
			return false;
		};
		inner.rooms.get(room_id).is_some_and(|room| room.members.contains(subject))
	}
}

pub type SharedDirectory = Arc<dyn RoomDirectory>;

#[cfg(test)]
mod tests {
	use super::*;

	fn channel(id: &str) -> Channel {
		Channel {
			id: ChannelId::new(id).unwrap(),
			name: id.to_string(),
			kind: ChannelKind::Text,
		}
	}

	async fn team_directory() -> (StaticDirectory, RoomId) {
		let directory = StaticDirectory::new();
		let room_id = RoomId::new("team").unwrap();
		directory
			.insert_room(Room {
				id: room_id.clone(),
				channels: vec![channel("planning"), channel("standup")],
				members: vec![SubjectId::new("alice").unwrap()],
			})
			.await;
		(directory, room_id)
	}

	#[tokio::test]
	async fn members_may_join_known_channels() {
		let (directory, _room) = team_directory().await;
		let alice = SubjectId::new("alice").unwrap();

		assert!(authorize_join(&directory, &alice, &ChannelId::new("planning").unwrap()).await.is_ok());

		let bob = SubjectId::new("bob").unwrap();
		assert!(matches!(
			authorize_join(&directory, &bob, &ChannelId::new("planning").unwrap()).await,
			Err(JoinError::NotAMember { .. })
		));
		assert!(matches!(
			authorize_join(&directory, &alice, &ChannelId::new("nowhere").unwrap()).await,
			Err(JoinError::UnknownChannel(_))
		));
	}

	#[tokio::test]
	async fn listing_preserves_directory_order() {
		let (directory, room_id) = team_directory().await;

		let channels = directory.list_channels(&room_id).await;
		assert_eq!(channels.len(), 2);
		assert_eq!(channels[0].id.as_str(), "planning");
		assert_eq!(channels[1].id.as_str(), "standup");

		assert!(directory.list_channels(&RoomId::new("ghost").unwrap()).await.is_empty());
	}

	#[tokio::test]
	async fn open_directory_admits_everyone() {
		let directory = OpenDirectory::new();
		let anyone = SubjectId::new("anyone").unwrap();
		assert!(authorize_join(&directory, &anyone, &ChannelId::fallback()).await.is_ok());
	}
}
