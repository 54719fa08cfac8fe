//! Network reachability observation.
//!
//! The platform path monitor is modelled as a `watch` channel of
//! [`PathStatus`]. [`ReachabilityMonitor`] derives a connected flag from it
//! and forwards changes to a weakly held [`ConnectionObserver`].

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Status reported by the path monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathStatus {
    /// A usable path exists.
    Satisfied,
    /// No usable path.
    Unsatisfied,
    /// A path could exist once a connection is brought up.
    RequiresConnection,
}

impl PathStatus {
    /// Only [`PathStatus::Satisfied`] counts as connected.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

/// Receives connectivity changes.
pub trait ConnectionObserver: Send + Sync {
    /// Called with the new connected flag.
    fn did_update_connection(&self, connected: bool);
}

type Delegate = Arc<Mutex<Option<Weak<dyn ConnectionObserver>>>>;

fn notify(delegate: &Delegate, connected: bool) {
    let observer = delegate.lock().as_ref().and_then(Weak::upgrade);
    if let Some(observer) = observer {
        observer.did_update_connection(connected);
    }
}

/// Watches a path status channel and reports connectivity changes.
pub struct ReachabilityMonitor {
    path: watch::Receiver<PathStatus>,
    delegate: Delegate,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReachabilityMonitor {
    /// Monitor the given path status channel.
    #[must_use]
    pub fn new(path: watch::Receiver<PathStatus>) -> Self {
        Self {
            path,
            delegate: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// A monitor paired with the sender that drives it.
    #[must_use]
    pub fn channel(initial: PathStatus) -> (watch::Sender<PathStatus>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self::new(rx))
    }

    /// Set the observer. Only a weak reference is kept.
    pub fn set_delegate(&self, observer: Weak<dyn ConnectionObserver>) {
        *self.delegate.lock() = Some(observer);
    }

    /// Start forwarding changes.
    ///
    /// The observer is called once right away with the current status,
    /// then once per change of the connected flag. Restarting replaces
    /// the previous forwarding task. Must be called from within a tokio
    /// runtime.
    pub fn start(&self) {
        self.stop();

        let mut rx = self.path.clone();
        let mut last = rx.borrow_and_update().is_connected();
        notify(&self.delegate, last);

        let delegate = Arc::clone(&self.delegate);
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connected = rx.borrow_and_update().is_connected();
                if connected != last {
                    last = connected;
                    tracing::info!(connected, "connectivity changed");
                    notify(&delegate, connected);
                }
            }
            tracing::debug!("path monitor closed");
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop forwarding. Calling it again does nothing.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// Whether the path is currently usable.
    pub async fn is_connected(&self) -> bool {
        self.path.borrow().is_connected()
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
