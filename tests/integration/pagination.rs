//! Integration tests for history paging.
//!
//! The newest page replaces confirmed history, older pages are appended
//! until the service runs out, catch-up pulls in what arrived since, and
//! locally pending messages survive every merge.

use std::sync::Arc;
use std::time::Duration;

use colloquy::chat::history::InMemoryStore;
use colloquy::chat::{ChatConfig, ChatError, ChatEvent, MessagesManager};
use colloquy::reachability::{PathStatus, ReachabilityMonitor};
use colloquy::transport::PageMode;
use colloquy::transport::loopback::{InjectedFailure, LoopbackService};
use colloquy_proto::message::{Message, SendStatus};
use colloquy_proto::wire::ApiVersion;
use tokio::sync::{mpsc, watch};

type Manager = MessagesManager<LoopbackService, InMemoryStore>;

const T0: u64 = 1_700_000_000;

fn seeded(count: u64, page_size: usize) -> Arc<LoopbackService> {
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8).with_page_size(page_size));
    for i in 0..count {
        service.push_agent_message(format!("message {i}"), T0 + i * 60);
    }
    service
}

fn manager(
    service: &Arc<LoopbackService>,
) -> (Manager, mpsc::Receiver<ChatEvent>, watch::Sender<PathStatus>) {
    let (path, monitor) = ReachabilityMonitor::channel(PathStatus::Satisfied);
    let (manager, events, _warnings) = MessagesManager::new(
        Arc::clone(service),
        InMemoryStore::new(),
        Arc::new(monitor),
        ChatConfig::default(),
    );
    (manager, events, path)
}

fn remote_ids(messages: &[Message]) -> Vec<i64> {
    messages
        .iter()
        .filter_map(|m| m.remote_id.map(|id| id.get()))
        .collect()
}

fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn load_more_walks_back_until_exhausted() {
    let service = seeded(12, 5);
    let (manager, _events, _path) = manager(&service);

    manager.handle_load_messages().await.unwrap();
    assert_eq!(remote_ids(&manager.messages().await), vec![12, 11, 10, 9, 8]);
    assert!(manager.can_load_more().await);

    let outcome = manager.handle_load_more().await.unwrap().unwrap();
    assert_eq!(outcome.added, 5);
    let outcome = manager.handle_load_more().await.unwrap().unwrap();
    assert_eq!(outcome.added, 2);
    assert_eq!(
        remote_ids(&manager.messages().await),
        (1..=12).rev().collect::<Vec<_>>()
    );

    // The next request comes back empty and ends paging.
    let outcome = manager.handle_load_more().await.unwrap().unwrap();
    assert_eq!(outcome.added, 0);
    assert!(!manager.can_load_more().await);

    let fetches_before = service.fetches().len();
    assert!(manager.handle_load_more().await.unwrap().is_none());
    assert_eq!(service.fetches().len(), fetches_before);

    let cursors: Vec<_> = service
        .fetches()
        .into_iter()
        .filter(|f| f.mode == PageMode::Before)
        .map(|f| f.cursor)
        .collect();
    assert_eq!(
        cursors,
        vec![Some("8".to_string()), Some("3".to_string()), Some("1".to_string())]
    );
}

#[tokio::test]
async fn short_history_cannot_load_more() {
    let service = seeded(3, 5);
    let (manager, _events, _path) = manager(&service);

    manager.handle_load_messages().await.unwrap();
    assert!(!manager.can_load_more().await);
    assert!(manager.handle_load_more().await.unwrap().is_none());
}

#[tokio::test]
async fn catch_up_fetches_only_newer_messages() {
    let service = seeded(4, 20);
    let (manager, _events, _path) = manager(&service);
    manager.handle_load_messages().await.unwrap();

    service.push_agent_message("new one", T0 + 10_000);
    service.push_agent_message("newer one", T0 + 10_060);

    let outcome = manager.handle_catch_up().await.unwrap();
    assert_eq!(outcome.added, 2);
    assert_eq!(remote_ids(&manager.messages().await), vec![6, 5, 4, 3, 2, 1]);

    let last = service.fetches().pop().unwrap();
    assert_eq!(last.mode, PageMode::After);
    assert_eq!(last.cursor.as_deref(), Some("4"));

    // Nothing new: nothing added.
    assert_eq!(manager.handle_catch_up().await.unwrap().added, 0);
}

#[tokio::test]
async fn reload_keeps_unsent_messages_on_top() {
    let service = seeded(3, 20);
    let (manager, _events, path) = manager(&service);
    manager.handle_load_messages().await.unwrap();

    path.send(PathStatus::Unsatisfied).unwrap();
    let unsent = manager.send_message("written offline").await.unwrap();
    assert_eq!(unsent.send_status, SendStatus::Failed);
    path.send(PathStatus::Satisfied).unwrap();

    manager.handle_load_messages().await.unwrap();
    let messages = manager.messages().await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].local_id, unsent.local_id);
    assert_eq!(messages[0].send_status, SendStatus::Failed);
    assert_eq!(remote_ids(&messages), vec![3, 2, 1]);
}

#[tokio::test]
async fn offline_load_makes_no_request() {
    let service = seeded(3, 20);
    let (manager, _events, path) = manager(&service);
    path.send(PathStatus::Unsatisfied).unwrap();

    assert!(matches!(
        manager.handle_load_messages().await,
        Err(ChatError::Offline)
    ));
    assert!(matches!(
        manager.handle_catch_up().await,
        Err(ChatError::Offline)
    ));
    assert!(service.fetches().is_empty());
}

#[tokio::test]
async fn failed_load_surfaces_notice_and_keeps_state() {
    let service = seeded(3, 20);
    let (manager, mut events, _path) = manager(&service);
    manager.handle_load_messages().await.unwrap();
    drain(&mut events);

    service.fail_next(InjectedFailure::Backend {
        status_code: 503,
        message: "Service is under maintenance".into(),
    });
    let result = manager.handle_load_messages().await;
    assert!(matches!(result, Err(ChatError::Transport(_))));
    assert_eq!(manager.messages().await.len(), 3);
    assert!(!manager.is_loading().await);

    let events = drain(&mut events);
    assert!(events.contains(&ChatEvent::Notice("Service is under maintenance".into())));
    assert_eq!(
        events.last(),
        Some(&ChatEvent::Loading {
            older: false,
            active: false
        })
    );
}

#[tokio::test(start_paused = true)]
async fn superseded_full_load_is_discarded() {
    let service = seeded(3, 20);
    service.set_latency(Some(Duration::from_millis(100)));
    let (manager, _events, _path) = manager(&service);

    let (first, second) = tokio::join!(manager.handle_load_messages(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.handle_load_messages().await
    });

    assert!(matches!(first, Err(ChatError::Stale(mode)) if mode == "all"));
    assert_eq!(second.unwrap().added, 3);
    assert_eq!(manager.messages().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn older_page_racing_a_reload_leaves_no_gap() {
    let service = seeded(12, 5);
    let (manager, _events, _path) = manager(&service);
    manager.handle_load_messages().await.unwrap();
    manager.handle_load_more().await.unwrap().unwrap();
    assert_eq!(remote_ids(&manager.messages().await), (3..=12).rev().collect::<Vec<_>>());

    // The older page is anchored on message 3, but the reload lands first
    // and cuts history back to the newest page.
    service.set_latency(Some(Duration::from_millis(100)));
    let (reload, older) = tokio::join!(manager.handle_load_messages(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.handle_load_more().await
    });
    assert!(reload.is_ok());
    assert!(matches!(older, Err(ChatError::Stale(_))));
    assert_eq!(remote_ids(&manager.messages().await), vec![12, 11, 10, 9, 8]);

    service.set_latency(None);
    while manager.handle_load_more().await.unwrap().is_some() {}
    assert_eq!(
        remote_ids(&manager.messages().await),
        (1..=12).rev().collect::<Vec<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn catch_up_overtaken_by_reload_is_discarded() {
    let service = seeded(3, 5);
    let (manager, _events, _path) = manager(&service);
    manager.handle_load_messages().await.unwrap();
    service.push_agent_message("late", T0 + 600);

    service.set_latency(Some(Duration::from_millis(100)));
    let (reload, catch_up) = tokio::join!(manager.handle_load_messages(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.handle_catch_up().await
    });
    assert_eq!(reload.unwrap().added, 1);
    assert!(matches!(catch_up, Err(ChatError::Stale(_))));
    assert_eq!(remote_ids(&manager.messages().await), vec![4, 3, 2, 1]);
}

#[tokio::test]
async fn welcome_and_sticky_follow_the_service() {
    let service = seeded(2, 20);
    service.set_welcome(Some("Hi there!".into()));
    service.set_sticky(Some("Office hours 9-5".into()));
    let (manager, mut events, _path) = manager(&service);

    manager.handle_load_messages().await.unwrap();
    assert_eq!(manager.welcome_message().await.as_deref(), Some("Hi there!"));
    assert_eq!(manager.sticky_message().await.as_deref(), Some("Office hours 9-5"));
    let seen = drain(&mut events);
    assert!(seen.contains(&ChatEvent::Sticky(Some("Office hours 9-5".into()))));

    // Catch-up refreshes the sticky banner.
    service.set_sticky(None);
    manager.handle_catch_up().await.unwrap();
    assert_eq!(manager.sticky_message().await, None);
    assert!(drain(&mut events).contains(&ChatEvent::Sticky(None)));
    assert_eq!(manager.welcome_message().await.as_deref(), Some("Hi there!"));
}
