//! Integration tests for restoring a conversation from local storage.
//!
//! A restart shows the cached conversation before any network traffic,
//! turns messages that were in flight into failed ones, and resumes
//! paging from the stored cursor.

use std::collections::BTreeMap;
use std::sync::Arc;

use colloquy::chat::history::{
    FileStore, InMemoryStore, MessageStore, PAGING_KEY, WELCOME_MESSAGE_KEY,
};
use colloquy::chat::{ChatConfig, ChatEvent, MessagesManager};
use colloquy::reachability::{PathStatus, ReachabilityMonitor};
use colloquy::transport::PageMode;
use colloquy::transport::loopback::LoopbackService;
use colloquy_proto::codec::StoreSnapshot;
use colloquy_proto::message::{Message, MessageType, RemoteId, SendStatus, Timestamp};
use colloquy_proto::wire::{ApiVersion, Paging};
use tokio::sync::mpsc;

const T0: u64 = 1_700_000_000;

fn manager<S: MessageStore + 'static>(
    service: &Arc<LoopbackService>,
    store: S,
    status: PathStatus,
) -> (MessagesManager<LoopbackService, S>, mpsc::Receiver<ChatEvent>) {
    let (_path, monitor) = ReachabilityMonitor::channel(status);
    let (manager, events, _warnings) = MessagesManager::new(
        Arc::clone(service),
        store,
        Arc::new(monitor),
        ChatConfig::default(),
    );
    (manager, events)
}

fn agent(id: i64, secs: u64, text: &str) -> Message {
    let mut message = Message::remote(
        RemoteId::new(id),
        MessageType::Agent,
        Timestamp::from_secs(secs),
    );
    message.message = Some(text.to_string());
    message
}

fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn in_flight_message_comes_back_failed_and_resendable() {
    let mut pending = Message::user_text("sent right before the crash");
    pending.send_status = SendStatus::Pending;
    let local_id = pending.local_id.unwrap();

    let store = InMemoryStore::with_snapshot(StoreSnapshot {
        messages: vec![pending, agent(1, T0, "How can I help?")],
        values: BTreeMap::new(),
    });
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    let (manager, _events) = manager(&service, store, PathStatus::Satisfied);

    assert_eq!(manager.load_cached_data().await.unwrap(), 2);
    let restored = manager.messages().await;
    assert_eq!(restored[0].send_status, SendStatus::Failed);

    // The conversion is written back.
    let stored = manager.history().store().snapshot().await;
    assert_eq!(stored.messages[0].send_status, SendStatus::Failed);

    let resent = manager.resend(local_id).await.unwrap();
    assert_eq!(resent.send_status, SendStatus::Success);
    assert_eq!(service.sent().len(), 1);
}

#[tokio::test]
async fn cached_conversation_is_shown_without_network() {
    let paging = Paging {
        before: "5".into(),
        after: "6".into(),
    };
    let mut values = BTreeMap::new();
    values.insert(WELCOME_MESSAGE_KEY.to_string(), "Welcome back".to_string());
    values.insert(PAGING_KEY.to_string(), serde_json::to_string(&paging).unwrap());
    let store = InMemoryStore::with_snapshot(StoreSnapshot {
        messages: vec![agent(6, T0 + 60, "Anything else?"), agent(5, T0, "Done.")],
        values,
    });

    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    let (manager, mut events) = manager(&service, store, PathStatus::Unsatisfied);

    manager.load_cached_data().await.unwrap();
    assert!(service.fetches().is_empty());
    assert_eq!(manager.welcome_message().await.as_deref(), Some("Welcome back"));
    assert!(manager.can_load_more().await);

    let events = drain(&mut events);
    let Some(ChatEvent::SetSections(sections)) = events.first() else {
        panic!("expected sections first, got {events:?}");
    };
    assert_eq!(sections.iter().map(|s| s.messages.len()).sum::<usize>(), 2);
    assert!(events.contains(&ChatEvent::Welcome(Some("Welcome back".into()))));
}

#[tokio::test]
async fn paging_resumes_from_restored_history() {
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8).with_page_size(3));
    for i in 0..6u64 {
        service.push_agent_message(format!("m{i}"), T0 + i * 60);
    }

    let paging = Paging {
        before: "4".into(),
        after: "6".into(),
    };
    let mut values = BTreeMap::new();
    values.insert(PAGING_KEY.to_string(), serde_json::to_string(&paging).unwrap());
    let store = InMemoryStore::with_snapshot(StoreSnapshot {
        messages: vec![
            agent(6, T0 + 300, "m5"),
            agent(5, T0 + 240, "m4"),
            agent(4, T0 + 180, "m3"),
        ],
        values,
    });
    let (manager, _events) = manager(&service, store, PathStatus::Satisfied);
    manager.load_cached_data().await.unwrap();

    let outcome = manager.handle_load_more().await.unwrap().unwrap();
    assert_eq!(outcome.added, 3);
    let request = service.fetches().pop().unwrap();
    assert_eq!(request.mode, PageMode::Before);
    assert_eq!(request.cursor.as_deref(), Some("4"));
    assert_eq!(manager.messages().await.len(), 6);
}

#[tokio::test]
async fn file_store_carries_a_session_over() {
    let dir = std::env::temp_dir().join(format!("colloquy-cold-{}", uuid::Uuid::now_v7()));
    let path = dir.join("history.bin");

    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    service.set_welcome(Some("Hello from support".into()));
    service.set_sticky(Some("We reply within a day".into()));
    service.push_agent_message("first", T0);
    service.push_agent_message("second", T0 + 60);

    {
        let store = FileStore::open(&path).await.unwrap();
        let (manager, _events) = manager(&service, store, PathStatus::Satisfied);
        manager.handle_load_messages().await.unwrap();
        manager.send_message("thanks").await.unwrap();
    }

    let store = FileStore::open(&path).await.unwrap();
    let (manager, _events) = manager(&service, store, PathStatus::Unsatisfied);
    assert_eq!(manager.load_cached_data().await.unwrap(), 3);
    assert_eq!(manager.welcome_message().await.as_deref(), Some("Hello from support"));
    assert_eq!(
        manager.sticky_message().await.as_deref(),
        Some("We reply within a day")
    );

    let messages = manager.messages().await;
    assert_eq!(messages[0].message.as_deref(), Some("thanks"));
    assert_eq!(messages[0].send_status, SendStatus::Success);
    assert!(messages.iter().all(|m| m.send_status == SendStatus::Success));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn clear_wipes_cache_for_the_next_session() {
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    service.push_agent_message("hello", T0);
    let (manager, mut events) = manager(&service, InMemoryStore::new(), PathStatus::Satisfied);
    manager.handle_load_messages().await.unwrap();
    drain(&mut events);

    manager.clear().await;
    assert!(manager.messages().await.is_empty());
    assert!(!manager.can_load_more().await);
    assert_eq!(drain(&mut events)[0], ChatEvent::SetSections(Vec::new()));

    let snapshot = manager.history().store().snapshot().await;
    assert!(snapshot.messages.is_empty());
    assert!(snapshot.values.is_empty());
}
