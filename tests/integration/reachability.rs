//! Integration tests for connectivity handling.
//!
//! The same monitor gates the manager's network calls and tells an
//! observer about changes, which is how a presenter knows when to catch
//! up and offer resends.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use colloquy::chat::history::InMemoryStore;
use colloquy::chat::{ChatConfig, ChatError, MessagesManager};
use colloquy::reachability::{ConnectionObserver, PathStatus, ReachabilityMonitor};
use colloquy::transport::loopback::LoopbackService;
use colloquy_proto::message::SendStatus;
use colloquy_proto::wire::ApiVersion;

#[derive(Default)]
struct Presenter {
    changes: Mutex<Vec<bool>>,
}

impl ConnectionObserver for Presenter {
    fn did_update_connection(&self, connected: bool) {
        self.changes.lock().push(connected);
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_lets_the_presenter_recover() {
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    service.push_agent_message("Hello!", 1_700_000_000);

    let (path, monitor) = ReachabilityMonitor::channel(PathStatus::Satisfied);
    let monitor = Arc::new(monitor);
    let presenter = Arc::new(Presenter::default());
    let weak: Weak<Presenter> = Arc::downgrade(&presenter);
    monitor.set_delegate(weak);
    monitor.start();

    let (manager, _events, _warnings) = MessagesManager::new(
        Arc::clone(&service),
        InMemoryStore::new(),
        Arc::clone(&monitor),
        ChatConfig::default(),
    );
    manager.handle_load_messages().await.unwrap();

    path.send(PathStatus::Unsatisfied).unwrap();
    settle().await;
    let failed = manager.send_message("lost in a tunnel").await.unwrap();
    assert_eq!(failed.send_status, SendStatus::Failed);
    assert!(matches!(
        manager.handle_catch_up().await,
        Err(ChatError::Offline)
    ));

    // Meanwhile the agent wrote again.
    service.push_agent_message("Are you still there?", 1_700_000_060);

    path.send(PathStatus::Satisfied).unwrap();
    settle().await;
    assert_eq!(*presenter.changes.lock(), vec![true, false, true]);

    assert_eq!(manager.handle_catch_up().await.unwrap().added, 1);
    let resent = manager.resend(failed.local_id.unwrap()).await.unwrap();
    assert_eq!(resent.send_status, SendStatus::Success);

    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn requires_connection_counts_as_offline() {
    let service = Arc::new(LoopbackService::new(ApiVersion::V1_8));
    let (_path, monitor) = ReachabilityMonitor::channel(PathStatus::RequiresConnection);
    let monitor = Arc::new(monitor);
    let presenter = Arc::new(Presenter::default());
    let weak: Weak<Presenter> = Arc::downgrade(&presenter);
    monitor.set_delegate(weak);
    monitor.start();

    let (manager, _events, _warnings) = MessagesManager::new(
        Arc::clone(&service),
        InMemoryStore::new(),
        Arc::clone(&monitor),
        ChatConfig::default(),
    );

    assert_eq!(*presenter.changes.lock(), vec![false]);
    assert!(matches!(
        manager.handle_load_messages().await,
        Err(ChatError::Offline)
    ));
    assert!(service.fetches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_reports_current_status_again() {
    let (path, monitor) = ReachabilityMonitor::channel(PathStatus::Satisfied);
    let presenter = Arc::new(Presenter::default());
    let weak: Weak<Presenter> = Arc::downgrade(&presenter);
    monitor.set_delegate(weak);

    monitor.start();
    monitor.stop();
    path.send(PathStatus::Unsatisfied).unwrap();
    settle().await;
    monitor.start();

    assert_eq!(*presenter.changes.lock(), vec![true, false]);
}
