//! Debounced batching of read acknowledgements.
//!
//! Every [`ReadReceiptBatcher::queue_message_read`] call adds an id to the
//! pending set and restarts the debounce window. When the window elapses
//! without another call, the whole set goes out in one
//! [`ReadReceiptSink::flush_read`] call. A failed flush merges its ids back
//! into the pending set; they go out with the next flush.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use colloquy_proto::message::RemoteId;

use crate::transport::{Transport, TransportError};

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Receiver of flushed read acknowledgements.
pub trait ReadReceiptSink: Send + Sync + 'static {
    /// Acknowledge every id in `ids` at once.
    fn flush_read(
        &self,
        ids: &BTreeSet<RemoteId>,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

impl<T: Transport + 'static> ReadReceiptSink for T {
    fn flush_read(
        &self,
        ids: &BTreeSet<RemoteId>,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        self.mark_read(ids)
    }
}

struct BatchState<S> {
    pending: BTreeSet<RemoteId>,
    /// Bumped on every queue or cancel; a timer only fires if it still
    /// holds the current generation.
    generation: u64,
    delegate: Weak<S>,
}

/// Collects read ids and flushes them after a quiet period.
pub struct ReadReceiptBatcher<S: ReadReceiptSink> {
    state: Arc<Mutex<BatchState<S>>>,
    debounce: Duration,
}

impl<S: ReadReceiptSink> ReadReceiptBatcher<S> {
    /// Create a batcher with the given debounce window and no delegate.
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BatchState {
                pending: BTreeSet::new(),
                generation: 0,
                delegate: Weak::new(),
            })),
            debounce,
        }
    }

    /// Set the flush target. Only a weak reference is kept.
    pub fn set_delegate(&self, delegate: &Arc<S>) {
        self.state.lock().delegate = Arc::downgrade(delegate);
    }

    /// Add `id` to the pending set and restart the debounce window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn queue_message_read(&self, id: RemoteId) {
        let generation = {
            let mut state = self.state.lock();
            state.pending.insert(id);
            state.generation += 1;
            state.generation
        };

        let state = Arc::clone(&self.state);
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            flush(&state, generation).await;
        });
    }

    /// Invalidate the running debounce window. Queued ids are kept and
    /// go out with the next flush.
    pub fn cancel(&self) {
        self.state.lock().generation += 1;
    }

    /// Ids waiting to be flushed.
    #[must_use]
    pub fn pending(&self) -> BTreeSet<RemoteId> {
        self.state.lock().pending.clone()
    }

    /// Drop every queued id and invalidate the timer.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.generation += 1;
    }
}

async fn flush<S: ReadReceiptSink>(state: &Mutex<BatchState<S>>, generation: u64) {
    let (ids, sink) = {
        let mut guard = state.lock();
        if guard.generation != generation || guard.pending.is_empty() {
            return;
        }
        let Some(sink) = guard.delegate.upgrade() else {
            tracing::debug!(pending = guard.pending.len(), "read receipts held, no delegate");
            return;
        };
        (std::mem::take(&mut guard.pending), sink)
    };

    match sink.flush_read(&ids).await {
        Ok(()) => tracing::debug!(count = ids.len(), "flushed read receipts"),
        Err(e) => {
            tracing::warn!(count = ids.len(), error = %e, "read receipt flush failed, re-queued");
            state.lock().pending.extend(ids);
        }
    }
}
