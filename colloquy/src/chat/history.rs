//! Local conversation storage and failure-resilient writing.
//!
//! Defines the [`MessageStore`] trait the manager persists the canonical
//! message list and a few string values through, two implementations
//! ([`InMemoryStore`] and the on-disk [`FileStore`]), and
//! [`ResilientHistoryWriter`] which wraps any store so that write failures
//! never abort a conversation operation.
//!
//! # Write failures
//!
//! If a store write fails (disk full, permissions, ...):
//! 1. The error is logged, never propagated.
//! 2. The write is queued and can be replayed with
//!    [`ResilientHistoryWriter::flush_pending`].
//! 3. A [`HistoryWarning`] is emitted so the UI can show a non-blocking
//!    notice.
//!
//! Writes reach the store in the order they were made. While anything is
//! queued, a new write first replays the queue and is itself queued if
//! that fails, so an old snapshot can never land on top of newer data.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use colloquy_proto::codec::{self, CodecError, StoreSnapshot};
use colloquy_proto::message::{LocalId, Message, RemoteId};

/// Store key of the welcome text.
pub const WELCOME_MESSAGE_KEY: &str = "welcomeMessage";
/// Store key of the sticky banner text.
pub const STICKY_MESSAGE_KEY: &str = "stickyMessage";
/// Store key of the JSON-encoded paging cursor.
pub const PAGING_KEY: &str = "paging";

/// Errors that can occur during history storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored bytes could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Persistence for one conversation.
///
/// Messages are kept newest first. Synthetic presentation messages are
/// never stored.
pub trait MessageStore: Send + Sync {
    /// Every stored message, newest first.
    fn all_messages(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, StoreError>> + Send;

    /// Replace the stored messages.
    fn save(
        &self,
        messages: &[Message],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Store one message at the newest (`at_front`) or oldest end, or
    /// replace it in place if its identity is already stored.
    fn insert(
        &self,
        message: &Message,
        at_front: bool,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Replace the stored copy of a message.
    fn update(
        &self,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Read a string value.
    fn string(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Write a string value; `None` removes it.
    fn set(
        &self,
        key: &str,
        value: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Remove everything.
    fn clear(&self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

fn apply_insert(snapshot: &mut StoreSnapshot, message: &Message, at_front: bool) {
    if message.is_synthetic() {
        return;
    }
    if let Some(existing) = snapshot.messages.iter_mut().find(|m| m.is_same(message)) {
        *existing = message.clone();
    } else if at_front {
        snapshot.messages.insert(0, message.clone());
    } else {
        snapshot.messages.push(message.clone());
    }
}

fn apply_update(snapshot: &mut StoreSnapshot, message: &Message) -> Result<(), StoreError> {
    let existing = snapshot
        .messages
        .iter_mut()
        .find(|m| m.is_same(message))
        .ok_or_else(|| StoreError::NotFound(describe(message)))?;
    *existing = message.clone();
    Ok(())
}

fn apply_set(snapshot: &mut StoreSnapshot, key: &str, value: Option<&str>) {
    match value {
        Some(v) => {
            snapshot.values.insert(key.to_string(), v.to_string());
        }
        None => {
            snapshot.values.remove(key);
        }
    }
}

fn describe(message: &Message) -> String {
    match (message.local_id, message.remote_id) {
        (_, Some(remote)) => format!("message {remote}"),
        (Some(local), None) => format!("message {local}"),
        (None, None) => "message without identity".to_string(),
    }
}

/// A history write that failed and needs to be replayed.
#[derive(Debug, Clone)]
enum PendingWrite {
    /// A full message-list save.
    Save(Vec<Message>),
    /// A single-message insert.
    Insert {
        /// Message to store.
        message: Message,
        /// Which end to store it at.
        at_front: bool,
    },
    /// A single-message update.
    Update(Message),
    /// A string value write.
    Set {
        /// Key.
        key: String,
        /// Value, `None` to remove.
        value: Option<String>,
    },
    /// A full wipe.
    Clear,
}

impl PendingWrite {
    const fn touches_messages(&self) -> bool {
        matches!(self, Self::Save(_) | Self::Insert { .. } | Self::Update(_))
    }

    /// Whether this write makes the earlier queued `other` pointless.
    fn supersedes(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Clear, _) => true,
            (Self::Save(_), earlier) => earlier.touches_messages(),
            (Self::Set { key, .. }, Self::Set { key: earlier, .. }) => key == earlier,
            _ => false,
        }
    }
}

fn enqueue(queue: &mut VecDeque<PendingWrite>, write: PendingWrite) {
    queue.retain(|earlier| !write.supersedes(earlier));
    queue.push_back(write);
}

/// Warning emitted when a history write fails.
///
/// The UI layer should watch for these and display a non-blocking
/// notification to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryWarning {
    /// The message list could not be saved.
    SaveFailed {
        /// Number of messages in the failed save.
        count: usize,
        /// Description of the error.
        reason: String,
    },
    /// A single message could not be written.
    MessageWriteFailed {
        /// Local identity, if any.
        local_id: Option<LocalId>,
        /// Server identity, if any.
        remote_id: Option<RemoteId>,
        /// Description of the error.
        reason: String,
    },
    /// A string value could not be written.
    ValueWriteFailed {
        /// Key of the value.
        key: String,
        /// Description of the error.
        reason: String,
    },
    /// The store could not be cleared.
    ClearFailed {
        /// Description of the error.
        reason: String,
    },
}

/// Wraps a [`MessageStore`] to handle write failures gracefully.
///
/// When a write fails, the `ResilientHistoryWriter`:
/// 1. Logs the error via `tracing::warn!`
/// 2. Queues the failed write for replay
/// 3. Emits a [`HistoryWarning`] through a channel
///
/// Queued writes are replayed ahead of any newer write, and a queued
/// write is dropped once a later one supersedes it.
pub struct ResilientHistoryWriter<S: MessageStore> {
    store: S,
    pending: Mutex<VecDeque<PendingWrite>>,
    warning_tx: tokio::sync::mpsc::Sender<HistoryWarning>,
}

impl<S: MessageStore> ResilientHistoryWriter<S> {
    /// Create a new resilient writer wrapping the given store.
    ///
    /// Returns the writer and a receiver for [`HistoryWarning`] events
    /// that the UI can consume.
    #[must_use]
    pub fn new(
        store: S,
        warning_buffer: usize,
    ) -> (Self, tokio::sync::mpsc::Receiver<HistoryWarning>) {
        let (tx, rx) = tokio::sync::mpsc::channel(warning_buffer);
        let writer = Self {
            store,
            pending: Mutex::new(VecDeque::new()),
            warning_tx: tx,
        };
        (writer, rx)
    }

    /// The wrapped store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Replace the stored messages.
    pub async fn save(&self, messages: &[Message]) {
        if let Err(err) = self.write(PendingWrite::Save(messages.to_vec())).await {
            tracing::warn!(
                count = messages.len(),
                error = %err,
                "history save failed, conversation continues unpersisted"
            );
            let _ = self.warning_tx.try_send(HistoryWarning::SaveFailed {
                count: messages.len(),
                reason: err.to_string(),
            });
        }
    }

    /// Store one message.
    pub async fn insert(&self, message: &Message, at_front: bool) {
        let write = PendingWrite::Insert {
            message: message.clone(),
            at_front,
        };
        if let Err(err) = self.write(write).await {
            self.message_failed(message, &err);
        }
    }

    /// Replace the stored copy of one message.
    pub async fn update(&self, message: &Message) {
        if let Err(err) = self.write(PendingWrite::Update(message.clone())).await {
            self.message_failed(message, &err);
        }
    }

    /// Write a string value; `None` removes it.
    pub async fn set(&self, key: &str, value: Option<&str>) {
        let write = PendingWrite::Set {
            key: key.to_string(),
            value: value.map(str::to_string),
        };
        if let Err(err) = self.write(write).await {
            tracing::warn!(key, error = %err, "history value write failed");
            let _ = self.warning_tx.try_send(HistoryWarning::ValueWriteFailed {
                key: key.to_string(),
                reason: err.to_string(),
            });
        }
    }

    /// Remove everything. Queued writes are dropped, a failed clear is
    /// queued in their place.
    pub async fn clear(&self) {
        if let Err(err) = self.write(PendingWrite::Clear).await {
            tracing::warn!(error = %err, "history clear failed");
            let _ = self.warning_tx.try_send(HistoryWarning::ClearFailed {
                reason: err.to_string(),
            });
        }
    }

    /// Delegate reads directly to the underlying store.
    ///
    /// Read failures are NOT handled resiliently; they bubble up to the
    /// caller, since there is nothing useful to replay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the underlying store read fails.
    pub async fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.store.all_messages().await
    }

    /// Read a string value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the underlying store read fails.
    pub async fn string(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.string(key).await
    }

    /// Replay pending writes in order, stopping at the first one that
    /// still fails.
    ///
    /// Returns the number of writes successfully completed.
    pub async fn flush_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let total = pending.len();
        let (succeeded, result) = self.replay(&mut pending).await;
        if let Err(err) = result {
            tracing::debug!(error = %err, remaining = pending.len(), "history replay stopped");
        }
        if succeeded > 0 {
            tracing::info!(
                succeeded,
                remaining = total - succeeded,
                "flushed pending history writes"
            );
        }
        succeeded
    }

    /// Return the number of pending writes awaiting replay.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Run `write` after everything queued before it, or queue it.
    async fn write(&self, write: PendingWrite) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().await;
        if let Err(err) = self.replay(&mut pending).await.1 {
            enqueue(&mut pending, write);
            return Err(err);
        }
        match self.execute(&write).await {
            Ok(()) => Ok(()),
            Err(err) if is_permanent(&err) => Err(err),
            Err(err) => {
                enqueue(&mut pending, write);
                Err(err)
            }
        }
    }

    async fn replay(
        &self,
        pending: &mut VecDeque<PendingWrite>,
    ) -> (usize, Result<(), StoreError>) {
        let mut succeeded = 0;
        while let Some(write) = pending.front() {
            match self.execute(write).await {
                Ok(()) => succeeded += 1,
                Err(err) if is_permanent(&err) => {
                    tracing::warn!(error = %err, "dropping history write that cannot succeed");
                }
                Err(err) => return (succeeded, Err(err)),
            }
            pending.pop_front();
        }
        (succeeded, Ok(()))
    }

    async fn execute(&self, write: &PendingWrite) -> Result<(), StoreError> {
        match write {
            PendingWrite::Save(messages) => self.store.save(messages).await,
            PendingWrite::Insert { message, at_front } => {
                self.store.insert(message, *at_front).await
            }
            PendingWrite::Update(message) => self.store.update(message).await,
            PendingWrite::Set { key, value } => self.store.set(key, value.as_deref()).await,
            PendingWrite::Clear => self.store.clear().await,
        }
    }

    fn message_failed(&self, message: &Message, err: &StoreError) {
        tracing::warn!(
            local_id = ?message.local_id,
            remote_id = ?message.remote_id,
            error = %err,
            "history message write failed"
        );
        let _ = self
            .warning_tx
            .try_send(HistoryWarning::MessageWriteFailed {
                local_id: message.local_id,
                remote_id: message.remote_id,
                reason: err.to_string(),
            });
    }
}

/// Errors that replaying cannot fix.
const fn is_permanent(err: &StoreError) -> bool {
    matches!(err, StoreError::NotFound(_) | StoreError::Codec(_))
}

/// In-memory implementation of [`MessageStore`].
///
/// Not persistent; all data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    snapshot: Mutex<StoreSnapshot>,
}

impl InMemoryStore {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// A copy of everything stored.
    pub async fn snapshot(&self) -> StoreSnapshot {
        self.snapshot.lock().await.clone()
    }
}

impl MessageStore for InMemoryStore {
    async fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self.snapshot.lock().await.messages.clone())
    }

    async fn save(&self, messages: &[Message]) -> Result<(), StoreError> {
        self.snapshot.lock().await.messages = messages
            .iter()
            .filter(|m| !m.is_synthetic())
            .cloned()
            .collect();
        Ok(())
    }

    async fn insert(&self, message: &Message, at_front: bool) -> Result<(), StoreError> {
        apply_insert(&mut *self.snapshot.lock().await, message, at_front);
        Ok(())
    }

    async fn update(&self, message: &Message) -> Result<(), StoreError> {
        apply_update(&mut *self.snapshot.lock().await, message)
    }

    async fn string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.snapshot.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        apply_set(&mut *self.snapshot.lock().await, key, value);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.snapshot.lock().await = StoreSnapshot::default();
        Ok(())
    }
}

/// On-disk implementation of [`MessageStore`].
///
/// Keeps the snapshot in memory and rewrites the whole file (postcard,
/// version-prefixed) after every change, through a temporary file and a
/// rename so that a crash never leaves a half-written store behind.
pub struct FileStore {
    path: PathBuf,
    snapshot: Mutex<StoreSnapshot>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories. A missing
    /// file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the directory cannot be
    /// created or the file cannot be read, and [`StoreError::Codec`] if
    /// the file holds something other than a current-format snapshot.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => codec::decode_snapshot(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(e) => {
                return Err(StoreError::Unavailable(format!("{}: {e}", path.display())));
            }
        };

        tracing::debug!(
            path = %path.display(),
            messages = snapshot.messages.len(),
            "opened history file"
        );
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let bytes = codec::encode_snapshot(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed(format!("{}: {e}", self.path.display())))
    }

    /// Apply `change` to a copy of the snapshot and persist it; the
    /// in-memory copy is only replaced once the file write succeeded.
    async fn modify(
        &self,
        change: impl FnOnce(&mut StoreSnapshot) -> Result<(), StoreError> + Send,
    ) -> Result<(), StoreError> {
        let mut guard = self.snapshot.lock().await;
        let mut next = guard.clone();
        change(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }
}

impl MessageStore for FileStore {
    async fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self.snapshot.lock().await.messages.clone())
    }

    async fn save(&self, messages: &[Message]) -> Result<(), StoreError> {
        self.modify(|s| {
            s.messages = messages.iter().filter(|m| !m.is_synthetic()).cloned().collect();
            Ok(())
        })
        .await
    }

    async fn insert(&self, message: &Message, at_front: bool) -> Result<(), StoreError> {
        self.modify(|s| {
            apply_insert(s, message, at_front);
            Ok(())
        })
        .await
    }

    async fn update(&self, message: &Message) -> Result<(), StoreError> {
        self.modify(|s| apply_update(s, message)).await
    }

    async fn string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.snapshot.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        self.modify(|s| {
            apply_set(s, key, value);
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.modify(|s| {
            *s = StoreSnapshot::default();
            Ok(())
        })
        .await
    }
}
