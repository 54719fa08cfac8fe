//! Integration tests for the side channels: read acknowledgements, the
//! user's typing events and the agent typing indicator.
//!
//! All timing runs on tokio's paused clock.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use colloquy::chat::history::InMemoryStore;
use colloquy::chat::{ChatConfig, ChatEvent, MessagesManager};
use colloquy::reachability::{PathStatus, ReachabilityMonitor};
use colloquy::transport::loopback::{InjectedFailure, LoopbackService};
use colloquy_proto::event::EventName;
use colloquy_proto::message::{MessageType, RemoteId};
use colloquy_proto::wire::ApiVersion;
use tokio::sync::mpsc;

type Manager = MessagesManager<LoopbackService, InMemoryStore>;

fn setup() -> (Arc<LoopbackService>, Arc<Manager>, mpsc::Receiver<ChatEvent>) {
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    let (_path, monitor) = ReachabilityMonitor::channel(PathStatus::Satisfied);
    let (manager, events, _warnings) = MessagesManager::new(
        Arc::clone(&service),
        InMemoryStore::new(),
        Arc::new(monitor),
        ChatConfig::default(),
    );
    (service, Arc::new(manager), events)
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

fn ids(raw: &[i64]) -> BTreeSet<RemoteId> {
    raw.iter().copied().map(RemoteId::new).collect()
}

fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

// ---------------------------------------------------------------------------
// Read acknowledgements
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reads_are_batched_after_a_quiet_period() {
    let (service, manager, _events) = setup();

    manager.handle_message_read(RemoteId::new(3)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    manager.handle_message_read(RemoteId::new(4)).await;
    manager.handle_message_read(RemoteId::new(3)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(service.read_batches().is_empty());

    advance(2).await;
    assert_eq!(service.read_batches(), vec![ids(&[3, 4])]);

    manager.handle_message_read(RemoteId::new(5)).await;
    advance(2).await;
    assert_eq!(service.read_batches(), vec![ids(&[3, 4]), ids(&[5])]);
}

#[tokio::test(start_paused = true)]
async fn failed_acknowledgement_goes_out_with_the_next_batch() {
    let (service, manager, _events) = setup();
    service.fail_next(InjectedFailure::Connection);

    manager.handle_message_read(RemoteId::new(1)).await;
    advance(2).await;
    assert!(service.read_batches().is_empty());

    manager.handle_message_read(RemoteId::new(2)).await;
    advance(2).await;
    assert_eq!(service.read_batches(), vec![ids(&[1, 2])]);
}

// ---------------------------------------------------------------------------
// User typing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn typing_burst_sends_start_then_stop_after_idle() {
    let (service, manager, _events) = setup();

    for _ in 0..10 {
        manager.user_did_type();
        advance(1).await;
    }
    assert_eq!(service.events(), vec![EventName::StartTyping]);

    advance(16).await;
    assert_eq!(
        service.events(),
        vec![EventName::StartTyping, EventName::StopTyping]
    );
}

#[tokio::test(start_paused = true)]
async fn long_burst_repeats_start() {
    let (service, manager, _events) = setup();

    for _ in 0..25 {
        manager.user_did_type();
        advance(1).await;
    }
    assert_eq!(
        service.events(),
        vec![EventName::StartTyping, EventName::StartTyping]
    );
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_is_sent_once() {
    let (service, manager, _events) = setup();

    manager.user_did_type();
    manager.user_stopped_typing();
    manager.user_stopped_typing();
    advance(30).await;
    assert_eq!(
        service.events(),
        vec![EventName::StartTyping, EventName::StopTyping]
    );
}

// ---------------------------------------------------------------------------
// Agent typing
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn agent_typing_row_is_shown_and_expires() {
    let (_service, manager, mut events) = setup();

    manager.handle_agent_began_typing().await;
    let rows = manager.presentation_rows().await;
    assert_eq!(rows.last().map(|m| m.message_type), Some(MessageType::AgentTyping));

    // A refresh keeps the row alive past the first deadline.
    advance(15).await;
    manager.handle_agent_began_typing().await;
    advance(15).await;
    assert!(manager.is_agent_typing().await);

    advance(10).await;
    assert!(!manager.is_agent_typing().await);
    assert_eq!(
        drain(&mut events),
        vec![ChatEvent::AgentTyping(true), ChatEvent::AgentTyping(false)]
    );
    assert!(manager.presentation_rows().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn agent_reply_replaces_typing_row() {
    let (service, manager, mut events) = setup();
    manager.handle_agent_began_typing().await;

    let id = service.push_agent_message("Sure, one moment.", 1_700_000_000);
    let reply = service.pushed(id).unwrap();
    assert!(manager.handle_new_message(reply).await);

    let seen = drain(&mut events);
    assert_eq!(seen[0], ChatEvent::AgentTyping(true));
    assert_eq!(seen[1], ChatEvent::AgentTyping(false));
    assert!(matches!(seen[2], ChatEvent::Add { .. }));

    let rows = manager.presentation_rows().await;
    assert!(rows.iter().all(|m| m.message_type != MessageType::AgentTyping));
    assert_eq!(rows.first().map(|m| m.message_type), Some(MessageType::Date));
}

#[tokio::test]
async fn agent_stop_signal_hides_row() {
    let (_service, manager, mut events) = setup();
    manager.handle_agent_began_typing().await;
    manager.handle_agent_stopped_typing().await;
    manager.handle_agent_stopped_typing().await;
    assert_eq!(
        drain(&mut events),
        vec![ChatEvent::AgentTyping(true), ChatEvent::AgentTyping(false)]
    );
}
