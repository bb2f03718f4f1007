#![forbid(unsafe_code)]

use confab_domain::{ChannelId, MessageDraft, MessageKind, SubjectId};

use crate::server::store::{
	DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT, MemoryMessageStore, MessageStore, NewMessage, SqliteMessageStore, clamp_limit,
};

fn new_message(channel: &str, author: &str, body: &str) -> NewMessage {
	NewMessage {
		channel_id: ChannelId::new(channel).expect("valid ChannelId"),
		author_id: SubjectId::new(author).expect("valid SubjectId"),
		author_display_name: "User".to_string(),
		author_avatar_ref: None,
		draft: MessageDraft::text(body.to_string()).expect("valid draft"),
	}
}

#[test]
fn limits_are_clamped_to_the_allowed_range() {
	assert_eq!(clamp_limit(None), DEFAULT_QUERY_LIMIT);
	assert_eq!(clamp_limit(Some(0)), 1);
	assert_eq!(clamp_limit(Some(10)), 10);
	assert_eq!(clamp_limit(Some(100_000)), MAX_QUERY_LIMIT);
}

#[tokio::test]
async fn memory_store_pages_newest_first() {
	let store = MemoryMessageStore::new();
	for i in 0..5 {
		store.append(new_message("general", "u1", &format!("m{i}"))).await.unwrap();
	}

	let page = store.query_page(&ChannelId::fallback(), None, 2).await.unwrap();
	assert_eq!(page.len(), 2);
	assert_eq!(page[0].body, "m4");
	assert_eq!(page[1].body, "m3");
}

#[tokio::test]
async fn memory_store_filters_by_channel_and_cursor() {
	let store = MemoryMessageStore::new();
	let first = store.append(new_message("general", "u1", "old")).await.unwrap();
	store.append(new_message("random", "u1", "elsewhere")).await.unwrap();
	let last = store.append(new_message("general", "u1", "new")).await.unwrap();
	assert!(last.created_at_unix_ms >= first.created_at_unix_ms);

	let page = store
		.query_page(&ChannelId::fallback(), Some(last.created_at_unix_ms), 50)
		.await
		.unwrap();
	assert!(page.iter().all(|m| m.created_at_unix_ms < last.created_at_unix_ms));
	assert!(page.iter().all(|m| m.channel_id == ChannelId::fallback()));
}

#[tokio::test]
async fn memory_store_timestamps_never_decrease() {
	let store = MemoryMessageStore::new();
	let mut prev = i64::MIN;
	for i in 0..20 {
		let msg = store.append(new_message("general", "u1", &format!("m{i}"))).await.unwrap();
		assert!(msg.created_at_unix_ms >= prev);
		prev = msg.created_at_unix_ms;
	}
}

#[tokio::test]
async fn memory_store_orders_concurrent_appends_by_timestamp() {
	let store = std::sync::Arc::new(MemoryMessageStore::new());

	let mut writers = Vec::new();
	for w in 0..8 {
		let store = store.clone();
		writers.push(tokio::spawn(async move {
			for i in 0..25 {
				store.append(new_message("general", "u1", &format!("w{w}-m{i}"))).await.unwrap();
			}
		}));
	}
	for writer in writers {
		writer.await.unwrap();
	}

	let page = store.query_page(&ChannelId::fallback(), None, MAX_QUERY_LIMIT).await.unwrap();
	assert_eq!(page.len(), 200);
	for pair in page.windows(2) {
		assert!(
			pair[0].created_at_unix_ms >= pair[1].created_at_unix_ms,
			"newest-first page regressed: {} before {}",
			pair[0].created_at_unix_ms,
			pair[1].created_at_unix_ms
		);
	}
}

#[tokio::test]
async fn sqlite_store_round_trips_all_kinds() {
	let store = SqliteMessageStore::open("sqlite::memory:").await.unwrap();

	store.append(new_message("general", "u1", "plain")).await.unwrap();

	let mut image = new_message("general", "u1", "look");
	image.draft = MessageDraft::image("https://example.test/cat.png".to_string(), "look".to_string()).unwrap();
	store.append(image).await.unwrap();

	let mut system = new_message("general", "u1", "joined");
	system.draft = MessageDraft::system("joined".to_string()).unwrap();
	store.append(system).await.unwrap();

	let page = store.query_page(&ChannelId::fallback(), None, 50).await.unwrap();
	assert_eq!(page.len(), 3);

	// newest first
	assert!(matches!(page[0].kind, MessageKind::System));
	match &page[1].kind {
		MessageKind::Image { media_ref } => assert_eq!(media_ref, "https://example.test/cat.png"),
		other => panic!("expected image kind, got {other:?}"),
	}
	assert!(matches!(page[2].kind, MessageKind::Text));
}

#[tokio::test]
async fn sqlite_store_cursor_pages_are_strictly_older() {
	let store = SqliteMessageStore::open("sqlite::memory:").await.unwrap();
	let mut stored = Vec::new();
	for i in 0..6 {
		stored.push(store.append(new_message("general", "u1", &format!("m{i}"))).await.unwrap());
	}

	let newest = stored.last().unwrap();
	let page = store
		.query_page(&ChannelId::fallback(), Some(newest.created_at_unix_ms), 50)
		.await
		.unwrap();
	assert!(page.iter().all(|m| m.created_at_unix_ms < newest.created_at_unix_ms));
	assert!(page.iter().all(|m| m.id != newest.id));
}

#[tokio::test]
async fn sqlite_store_scopes_queries_to_the_channel() {
	let store = SqliteMessageStore::open("sqlite::memory:").await.unwrap();
	store.append(new_message("general", "u1", "here")).await.unwrap();
	store.append(new_message("random", "u2", "there")).await.unwrap();

	let page = store
		.query_page(&ChannelId::new("random").unwrap(), None, 50)
		.await
		.unwrap();
	assert_eq!(page.len(), 1);
	assert_eq!(page[0].body, "there");
	assert_eq!(page[0].author_id.as_str(), "u2");
}
