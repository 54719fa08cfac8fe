//! Conversation engine for Colloquy.
//!
//! Contains the [`MessagesManager`] which owns the canonical message list
//! of one conversation, merges fetched history pages into it, drives the
//! send lifecycle of user messages (pending -> success / failed), throttles
//! typing and read signals, and keeps local storage in step.
//!
//! Every mutation of conversation state happens under one async mutex and
//! holds it until its storage write completed, so adds, updates and page
//! merges never interleave. Network calls are awaited outside the lock.
//! The presenter learns about changes through [`ChatEvent`]s.

pub mod collection;
pub mod history;
pub mod pagination;
pub mod receipts;
mod receive;
mod send;
pub mod typing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use tokio::sync::{Mutex, mpsc};

use colloquy_proto::message::{
    DEFAULT_MAX_MEDIA_SIZE, LocalId, MediaRef, Message, SendStatus, ValidationError,
};
use colloquy_proto::wire::{ApiVersion, DecodeError, Paging};

use crate::reachability::ReachabilityMonitor;
use crate::transport::{FetchRequest, PageMode, Transport, TransportError};

use collection::{ChronologicalCollection, Position, Section};
use history::{
    HistoryWarning, MessageStore, PAGING_KEY, ResilientHistoryWriter, STICKY_MESSAGE_KEY,
    StoreError, WELCOME_MESSAGE_KEY,
};
use pagination::{ConversationState, MergeOutcome};
use receipts::ReadReceiptBatcher;
use typing::TypingThrottle;

/// Errors returned by [`MessagesManager`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Local validation rejected the input before any network call.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The transport call failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reading local storage failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A pushed payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No resendable message with this id.
    #[error("no failed message {0}")]
    NotFound(LocalId),

    /// The network is unreachable; nothing was requested.
    #[error("network unreachable")]
    Offline,

    /// A newer request for the same resource superseded this one.
    #[error("superseded {0} response discarded")]
    Stale(String),
}

/// Diff instructions for the presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Replace everything shown with these sections.
    SetSections(Vec<Section>),
    /// A message was inserted.
    Add {
        /// Where it landed.
        position: Position,
        /// The message.
        message: Message,
    },
    /// A message changed in place (and may have moved).
    Update {
        /// Where it is now.
        position: Position,
        /// The new value.
        message: Message,
    },
    /// The agent started or stopped typing.
    AgentTyping(bool),
    /// A history load started or finished.
    Loading {
        /// Older history (`true`) or a full refresh.
        older: bool,
        /// Whether the load is in progress.
        active: bool,
    },
    /// The sticky banner changed.
    Sticky(Option<String>),
    /// The current quick-reply options changed.
    QuickReplies(Option<Vec<String>>),
    /// The welcome text changed.
    Welcome(Option<String>),
    /// A user-facing notice from the service.
    Notice(String),
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Protocol version spoken with the service.
    pub api_version: ApiVersion,
    /// Capacity of the [`ChatEvent`] channel.
    pub event_buffer: usize,
    /// Capacity of the [`HistoryWarning`] channel.
    pub warning_buffer: usize,
    /// Offset in which day sections are bucketed.
    pub calendar_offset: FixedOffset,
    /// Quiet period before read acknowledgements are flushed.
    pub read_debounce: Duration,
    /// Minimum gap between two `startTyping` events in one burst.
    pub typing_start_interval: Duration,
    /// Idle time before `stopTyping`.
    pub typing_stop_delay: Duration,
    /// How long the agent typing row stays without a new signal.
    pub agent_typing_timeout: Duration,
    /// Largest media upload accepted.
    pub max_media_size: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_version: ApiVersion::default(),
            event_buffer: 256,
            warning_buffer: 16,
            calendar_offset: Utc.fix(),
            read_debounce: receipts::DEFAULT_DEBOUNCE,
            typing_start_interval: typing::DEFAULT_START_INTERVAL,
            typing_stop_delay: typing::DEFAULT_STOP_DELAY,
            agent_typing_timeout: Duration::from_secs(20),
            max_media_size: DEFAULT_MAX_MEDIA_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RequestKey {
    Page(PageMode),
    Media(String),
}

/// Generation counters for supersedable requests.
#[derive(Default)]
struct RequestTracker {
    generations: parking_lot::Mutex<HashMap<RequestKey, u64>>,
}

impl RequestTracker {
    fn begin(&self, key: &RequestKey) -> u64 {
        let mut generations = self.generations.lock();
        let generation = generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn is_current(&self, key: &RequestKey, generation: u64) -> bool {
        self.generations.lock().get(key) == Some(&generation)
    }

    /// Like [`Self::is_current`], and forgets the key when it was.
    fn finish(&self, key: &RequestKey, generation: u64) -> bool {
        let mut generations = self.generations.lock();
        if generations.get(key) == Some(&generation) {
            generations.remove(key);
            true
        } else {
            false
        }
    }
}

struct TypingState {
    throttle: TypingThrottle,
    /// Bumped on every keystroke; a stop timer only acts if it still holds
    /// the current generation.
    generation: u64,
}

struct Inner {
    conversation: ConversationState,
    collection: ChronologicalCollection,
    quick_replies: Option<Vec<String>>,
    agent_typing: bool,
    agent_typing_generation: u64,
    is_loading: bool,
    is_loading_more: bool,
}

/// Orchestrates one conversation.
pub struct MessagesManager<T: Transport + 'static, S: MessageStore + 'static> {
    transport: Arc<T>,
    history: ResilientHistoryWriter<S>,
    reachability: Arc<ReachabilityMonitor>,
    receipts: ReadReceiptBatcher<T>,
    state: Mutex<Inner>,
    typing: Arc<parking_lot::Mutex<TypingState>>,
    requests: RequestTracker,
    event_tx: mpsc::Sender<ChatEvent>,
    config: ChatConfig,
}

impl<T: Transport + 'static, S: MessageStore + 'static> MessagesManager<T, S> {
    /// Creates a new `MessagesManager`.
    ///
    /// Returns the manager, a receiver for [`ChatEvent`]s the presenter
    /// should consume, and a receiver for [`HistoryWarning`]s.
    pub fn new(
        transport: Arc<T>,
        store: S,
        reachability: Arc<ReachabilityMonitor>,
        config: ChatConfig,
    ) -> (
        Self,
        mpsc::Receiver<ChatEvent>,
        mpsc::Receiver<HistoryWarning>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (history, warning_rx) =
            ResilientHistoryWriter::new(store, config.warning_buffer.max(1));
        let receipts = ReadReceiptBatcher::new(config.read_debounce);
        receipts.set_delegate(&transport);

        let manager = Self {
            transport,
            history,
            reachability,
            receipts,
            state: Mutex::new(Inner {
                conversation: ConversationState::default(),
                collection: ChronologicalCollection::new(config.calendar_offset),
                quick_replies: None,
                agent_typing: false,
                agent_typing_generation: 0,
                is_loading: false,
                is_loading_more: false,
            }),
            typing: Arc::new(parking_lot::Mutex::new(TypingState {
                throttle: TypingThrottle::new(
                    config.typing_start_interval,
                    config.typing_stop_delay,
                ),
                generation: 0,
            })),
            requests: RequestTracker::default(),
            event_tx,
            config,
        };
        (manager, event_rx, warning_rx)
    }

    /// Restore the conversation from local storage.
    ///
    /// Messages that were still pending when the previous session ended
    /// have no request in flight any more; they come back as failed so
    /// they can be resent. Returns the number of restored messages.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] if the store cannot be read.
    pub async fn load_cached_data(&self) -> Result<usize, ChatError> {
        let mut messages = self.history.all_messages().await?;
        let welcome = self.history.string(WELCOME_MESSAGE_KEY).await?;
        let sticky = self.history.string(STICKY_MESSAGE_KEY).await?;
        let paging = match self.history.string(PAGING_KEY).await? {
            Some(raw) => match serde_json::from_str::<Paging>(&raw) {
                Ok(paging) => Some(paging),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable stored paging cursor");
                    None
                }
            },
            None => None,
        };

        messages.retain(|m| !m.is_synthetic());
        let mut interrupted = 0usize;
        for message in &mut messages {
            if message.is_unconfirmed() && message.send_status == SendStatus::Pending {
                message.send_status = SendStatus::Failed;
                interrupted += 1;
            }
        }
        let count = messages.len();

        let mut inner = self.state.lock().await;
        inner.conversation.restore(messages, welcome, sticky, paging);
        if interrupted > 0 {
            self.history.save(&inner.conversation.original_messages).await;
        }
        self.project(&mut inner);
        self.emit(ChatEvent::Welcome(inner.conversation.welcome_message.clone()));
        self.emit(ChatEvent::Sticky(inner.conversation.sticky_message.clone()));
        drop(inner);

        tracing::info!(count, interrupted, "restored cached conversation");
        Ok(count)
    }

    /// Fetch the newest page and replace confirmed history with it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Offline`] without a request when unreachable,
    /// [`ChatError::Transport`] if the fetch failed, or
    /// [`ChatError::Stale`] if a newer full load overtook this one.
    pub async fn handle_load_messages(&self) -> Result<MergeOutcome, ChatError> {
        if !self.reachability.is_connected().await {
            tracing::info!("skipping history load while offline");
            return Err(ChatError::Offline);
        }
        let key = RequestKey::Page(PageMode::All);
        let generation = self.requests.begin(&key);
        self.set_loading(false, true).await;
        let result = self.fetch_page(PageMode::All, None, generation, None).await;

        // Only the newest full load ends the loading state.
        let mut inner = self.state.lock().await;
        if self.requests.is_current(&key, generation) {
            self.mark_loading(&mut inner, false, false);
        }
        drop(inner);
        result
    }

    /// Fetch messages newer than the newest confirmed one.
    ///
    /// # Errors
    ///
    /// Same as [`Self::handle_load_messages`]. A full load that finishes
    /// first also makes this response stale.
    pub async fn handle_catch_up(&self) -> Result<MergeOutcome, ChatError> {
        if !self.reachability.is_connected().await {
            return Err(ChatError::Offline);
        }
        let (anchor, epoch) = {
            let inner = self.state.lock().await;
            (inner.conversation.after_anchor(), inner.conversation.epoch())
        };
        let generation = self.requests.begin(&RequestKey::Page(PageMode::After));
        self.fetch_page(PageMode::After, anchor, generation, Some(epoch))
            .await
    }

    /// Fetch older history if there is any.
    ///
    /// Returns `Ok(None)` without a request when nothing more can be
    /// loaded or a load is already running.
    ///
    /// # Errors
    ///
    /// Same as [`Self::handle_catch_up`].
    pub async fn handle_load_more(&self) -> Result<Option<MergeOutcome>, ChatError> {
        let (anchor, epoch) = {
            let inner = self.state.lock().await;
            if !inner.conversation.can_load_more() || inner.is_loading_more {
                return Ok(None);
            }
            (inner.conversation.before_anchor(), inner.conversation.epoch())
        };
        if !self.reachability.is_connected().await {
            return Err(ChatError::Offline);
        }

        let generation = self.requests.begin(&RequestKey::Page(PageMode::Before));
        self.set_loading(true, true).await;
        let result = self
            .fetch_page(PageMode::Before, anchor, generation, Some(epoch))
            .await;
        self.set_loading(true, false).await;
        result.map(Some)
    }

    /// Download media. A newer request for the same media supersedes
    /// this one.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] if the download failed, or
    /// [`ChatError::Stale`] if it was superseded.
    pub async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, ChatError> {
        let key = RequestKey::Media(media.id.clone());
        let generation = self.requests.begin(&key);
        let result = self.transport.fetch_media(media).await;
        if !self.requests.finish(&key, generation) {
            tracing::debug!(media_id = %media.id, "discarding superseded media download");
            return Err(ChatError::Stale(media.id.clone()));
        }
        result
            .inspect_err(|e| self.surface(e))
            .map_err(ChatError::from)
    }

    /// Everything the presenter shows, top to bottom: the loading
    /// placeholder while older history loads, the welcome row, each day
    /// section preceded by its date separator, and the agent typing row.
    pub async fn presentation_rows(&self) -> Vec<Message> {
        let inner = self.state.lock().await;
        let capacity = inner.collection.len() + inner.collection.sections().len() + 3;
        let mut rows = Vec::with_capacity(capacity);
        if inner.is_loading_more {
            rows.push(Message::loading());
        }
        if let Some(welcome) = &inner.conversation.welcome_message {
            rows.push(Message::info(welcome.clone()));
        }
        for section in inner.collection.sections() {
            if let Some(first) = section.messages.first() {
                rows.push(Message::date_separator(first.time));
            }
            rows.extend(section.messages.iter().cloned());
        }
        if inner.agent_typing {
            rows.push(Message::agent_typing());
        }
        rows
    }

    /// Forget the conversation and wipe local storage.
    pub async fn clear(&self) {
        let mut inner = self.state.lock().await;
        inner.conversation.clear();
        inner.collection.clear();
        inner.agent_typing = false;
        inner.agent_typing_generation += 1;
        self.receipts.clear();
        self.history.clear().await;

        self.emit(ChatEvent::SetSections(Vec::new()));
        if inner.quick_replies.take().is_some() {
            self.emit(ChatEvent::QuickReplies(None));
        }
        self.emit(ChatEvent::Welcome(None));
        self.emit(ChatEvent::Sticky(None));
        tracing::info!("conversation cleared");
    }

    /// Canonical messages, newest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.conversation.original_messages.clone()
    }

    /// The projection's day sections.
    pub async fn sections(&self) -> Vec<Section> {
        self.state.lock().await.collection.sections().to_vec()
    }

    /// Whether older history can be requested.
    pub async fn can_load_more(&self) -> bool {
        self.state.lock().await.conversation.can_load_more()
    }

    /// The current quick-reply options.
    pub async fn quick_replies(&self) -> Option<Vec<String>> {
        self.state.lock().await.quick_replies.clone()
    }

    /// Whether the agent typing row is shown.
    pub async fn is_agent_typing(&self) -> bool {
        self.state.lock().await.agent_typing
    }

    /// Whether a full history load is running.
    pub async fn is_loading(&self) -> bool {
        self.state.lock().await.is_loading
    }

    /// The welcome text.
    pub async fn welcome_message(&self) -> Option<String> {
        self.state.lock().await.conversation.welcome_message.clone()
    }

    /// The sticky banner text.
    pub async fn sticky_message(&self) -> Option<String> {
        self.state.lock().await.conversation.sticky_message.clone()
    }

    /// The storage writer, for replaying failed writes.
    pub const fn history(&self) -> &ResilientHistoryWriter<S> {
        &self.history
    }

    /// The engine settings.
    pub const fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Fetch one page and merge it, unless a newer request of the same
    /// mode was started meanwhile or, when `epoch` is given, confirmed
    /// history was replaced since the cursor was taken.
    async fn fetch_page(
        &self,
        mode: PageMode,
        cursor: Option<String>,
        generation: u64,
        epoch: Option<u64>,
    ) -> Result<MergeOutcome, ChatError> {
        let key = RequestKey::Page(mode);
        let result = self.transport.fetch(FetchRequest { mode, cursor }).await;

        let mut inner = self.state.lock().await;
        if !self.requests.is_current(&key, generation) {
            tracing::debug!(%mode, generation, "discarding superseded page");
            return Err(ChatError::Stale(mode.to_string()));
        }
        if epoch.is_some_and(|e| e != inner.conversation.epoch()) {
            tracing::debug!(%mode, "discarding page anchored on replaced history");
            return Err(ChatError::Stale(mode.to_string()));
        }
        let page = result.inspect_err(|e| self.surface(e))?;

        let outcome = inner.conversation.handle(page, mode);
        self.persist(&inner.conversation).await;
        self.project(&mut inner);
        if outcome.welcome_changed {
            self.emit(ChatEvent::Welcome(inner.conversation.welcome_message.clone()));
        }
        if outcome.sticky_changed {
            self.emit(ChatEvent::Sticky(inner.conversation.sticky_message.clone()));
        }
        Ok(outcome)
    }

    async fn set_loading(&self, older: bool, active: bool) {
        let mut inner = self.state.lock().await;
        self.mark_loading(&mut inner, older, active);
    }

    fn mark_loading(&self, inner: &mut Inner, older: bool, active: bool) {
        let flag = if older {
            &mut inner.is_loading_more
        } else {
            &mut inner.is_loading
        };
        if *flag != active {
            *flag = active;
            self.emit(ChatEvent::Loading { older, active });
        }
    }

    async fn persist(&self, conversation: &ConversationState) {
        self.history.save(&conversation.original_messages).await;
        self.history
            .set(WELCOME_MESSAGE_KEY, conversation.welcome_message.as_deref())
            .await;
        self.history
            .set(STICKY_MESSAGE_KEY, conversation.sticky_message.as_deref())
            .await;
        match conversation.paging.as_ref().map(serde_json::to_string) {
            Some(Ok(raw)) => self.history.set(PAGING_KEY, Some(&raw)).await,
            Some(Err(e)) => tracing::warn!(error = %e, "paging cursor not persisted"),
            None => self.history.set(PAGING_KEY, None).await,
        }
    }

    /// Rebuild the projection from the canonical list.
    fn project(&self, inner: &mut Inner) {
        let visible = inner
            .conversation
            .original_messages
            .iter()
            .filter(|m| !m.has_quick_replies())
            .cloned();
        inner.collection.set(visible);
        self.emit(ChatEvent::SetSections(inner.collection.sections().to_vec()));
        self.refresh_quick_replies(inner);
    }

    /// The quick-reply slot follows the newest message.
    fn refresh_quick_replies(&self, inner: &mut Inner) {
        let slot = inner
            .conversation
            .newest()
            .filter(|m| m.has_quick_replies())
            .map(|m| m.quick_replies.clone());
        if slot != inner.quick_replies {
            inner.quick_replies.clone_from(&slot);
            self.emit(ChatEvent::QuickReplies(slot));
        }
    }

    fn surface(&self, err: &TransportError) {
        tracing::warn!(error = %err, "transport call failed");
        if let TransportError::Backend(backend) = err {
            for notification in backend.notifications() {
                self.emit(ChatEvent::Notice(notification.message.clone()));
            }
        }
    }

    fn emit(&self, event: ChatEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!(error = %e, "chat event dropped");
        }
    }
}
