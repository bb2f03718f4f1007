#![forbid(unsafe_code)]

use confab_domain::{ChannelId, Identity, SubjectId};
use confab_protocol::ServerEvent;
use tokio::sync::mpsc;

use crate::server::registry::SubscriptionRegistry;

fn identity(sub: &str) -> Identity {
	Identity {
		subject_id: SubjectId::new(sub).expect("valid SubjectId"),
		display_name: None,
		avatar_ref: None,
	}
}

fn channel(name: &str) -> ChannelId {
	ChannelId::new(name).expect("valid ChannelId")
}

#[tokio::test]
async fn join_is_idempotent_and_scoped_to_the_channel() {
	let registry = SubscriptionRegistry::new();
	let (tx, _rx) = mpsc::channel::<ServerEvent>(8);
	let conn = registry.register(identity("u1"), tx).await;

	assert!(registry.join(conn, &channel("a")).await);
	assert!(!registry.join(conn, &channel("a")).await, "second join must be a no-op");

	assert_eq!(registry.subscriber_count(&channel("a")).await, 1);
	assert_eq!(registry.subscriber_count(&channel("b")).await, 0);
}

#[tokio::test]
async fn leave_removes_only_the_named_channel() {
	let registry = SubscriptionRegistry::new();
	let (tx, _rx) = mpsc::channel::<ServerEvent>(8);
	let conn = registry.register(identity("u1"), tx).await;

	registry.join(conn, &channel("a")).await;
	registry.join(conn, &channel("b")).await;

	assert!(registry.leave(conn, &channel("a")).await);
	assert!(!registry.leave(conn, &channel("a")).await, "second leave must be a no-op");

	let mut channels = registry.channels_of(conn).await;
	channels.sort_by(|a, b| a.as_str().cmp(b.as_str()));
	assert_eq!(channels, vec![channel("b")]);
}

#[tokio::test]
async fn unregister_clears_every_subscription() {
	let registry = SubscriptionRegistry::new();
	let (tx, _rx) = mpsc::channel::<ServerEvent>(8);
	let conn = registry.register(identity("u1"), tx).await;

	registry.join(conn, &channel("a")).await;
	registry.join(conn, &channel("b")).await;
	registry.unregister(conn).await;

	assert_eq!(registry.subscriber_count(&channel("a")).await, 0);
	assert_eq!(registry.subscriber_count(&channel("b")).await, 0);
	assert!(registry.identity_of(conn).await.is_none());
	assert!(!registry.join(conn, &channel("a")).await, "joins after unregister must fail");
}

#[tokio::test]
async fn closed_senders_are_pruned_on_fanout_lookup() {
	let registry = SubscriptionRegistry::new();

	let (tx_dead, rx_dead) = mpsc::channel::<ServerEvent>(8);
	let dead = registry.register(identity("u1"), tx_dead).await;
	registry.join(dead, &channel("a")).await;
	drop(rx_dead);

	let (tx_live, _rx_live) = mpsc::channel::<ServerEvent>(8);
	let live = registry.register(identity("u2"), tx_live).await;
	registry.join(live, &channel("a")).await;

	let subscribers = registry.subscribers_of(&channel("a")).await;
	assert_eq!(subscribers.len(), 1);
	assert_eq!(subscribers[0].0, live);

	assert!(registry.identity_of(dead).await.is_none(), "dead connection must be gone");
	assert_eq!(registry.subscriber_count(&channel("a")).await, 1);
}

#[tokio::test]
async fn identities_are_kept_per_connection() {
	let registry = SubscriptionRegistry::new();
	let (tx1, _rx1) = mpsc::channel::<ServerEvent>(8);
	let (tx2, _rx2) = mpsc::channel::<ServerEvent>(8);

	let c1 = registry.register(identity("u1"), tx1).await;
	let c2 = registry.register(identity("u2"), tx2).await;

	assert_eq!(registry.identity_of(c1).await.map(|i| i.subject_id), Some(SubjectId::new("u1").unwrap()));
	assert_eq!(registry.identity_of(c2).await.map(|i| i.subject_id), Some(SubjectId::new("u2").unwrap()));
}
