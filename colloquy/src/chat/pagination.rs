//! Merging fetched history pages into the canonical message list.

use colloquy_proto::message::{Agent, Message};
use colloquy_proto::wire::{MessageCollection, Paging};

use crate::transport::PageMode;

/// Canonical conversation state owned by the manager.
///
/// `original_messages` is newest first. Unconfirmed user messages
/// (pending or failed) always sit ahead of confirmed history after a merge.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    /// Every known non-synthetic message, newest first.
    pub original_messages: Vec<Message>,
    /// Welcome text shown above the conversation.
    pub welcome_message: Option<String>,
    /// Banner text shown independent of the timeline.
    pub sticky_message: Option<String>,
    /// Current agent.
    pub agent: Option<Agent>,
    /// Cursor from the last full refresh.
    pub paging: Option<Paging>,
    exhausted: bool,
    epoch: u64,
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Messages that were not known before the merge.
    pub added: usize,
    /// Whether the welcome text changed.
    pub welcome_changed: bool,
    /// Whether the sticky text changed.
    pub sticky_changed: bool,
}

impl ConversationState {
    /// Replace everything with state restored from storage.
    pub fn restore(
        &mut self,
        original_messages: Vec<Message>,
        welcome_message: Option<String>,
        sticky_message: Option<String>,
        paging: Option<Paging>,
    ) {
        *self = Self {
            original_messages,
            welcome_message,
            sticky_message,
            agent: None,
            paging,
            exhausted: false,
            epoch: self.epoch + 1,
        };
    }

    /// Bumped whenever confirmed history is replaced wholesale. A `Before`
    /// or `After` page requested under an older epoch was anchored on a
    /// list that no longer exists and must not be merged.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Merge a fetched page.
    pub fn handle(&mut self, collection: MessageCollection, mode: PageMode) -> MergeOutcome {
        let MessageCollection {
            messages,
            agent,
            paging,
            sticky_message,
            welcome_message,
        } = collection;
        let mut outcome = MergeOutcome::default();

        match mode {
            PageMode::All => {
                let before = std::mem::take(&mut self.original_messages);
                let (pending, previous): (Vec<_>, Vec<_>) =
                    before.into_iter().partition(Message::is_unconfirmed);
                let fetched = dedup(messages);
                outcome.added = fetched
                    .iter()
                    .filter(|m| !previous.iter().any(|p| p.is_same(m)))
                    .count();

                self.original_messages = pending;
                self.original_messages.extend(fetched);

                outcome.welcome_changed = self.welcome_message != welcome_message;
                outcome.sticky_changed = self.sticky_message != sticky_message;
                self.welcome_message = welcome_message;
                self.sticky_message = sticky_message;
                self.agent = agent;
                self.paging = Some(paging);
                self.exhausted = false;
                self.epoch += 1;
            }
            PageMode::Before => {
                if messages.is_empty() {
                    self.exhausted = true;
                }
                for message in messages {
                    if !self.contains(&message) {
                        self.original_messages.push(message);
                        outcome.added += 1;
                    }
                }
            }
            PageMode::After => {
                let before = std::mem::take(&mut self.original_messages);
                let (pending, confirmed): (Vec<_>, Vec<_>) =
                    before.into_iter().partition(Message::is_unconfirmed);
                let fresh: Vec<Message> = dedup(messages)
                    .into_iter()
                    .filter(|m| !confirmed.iter().any(|c| c.is_same(m)))
                    .collect();
                outcome.added = fresh.len();

                self.original_messages = pending;
                self.original_messages.extend(fresh);
                self.original_messages.extend(confirmed);

                outcome.sticky_changed = self.sticky_message != sticky_message;
                self.sticky_message = sticky_message;
                if agent.is_some() {
                    self.agent = agent;
                }
            }
        }

        tracing::debug!(
            mode = %mode,
            added = outcome.added,
            total = self.original_messages.len(),
            "merged page"
        );
        outcome
    }

    /// Whether older history can be requested.
    #[must_use]
    pub fn can_load_more(&self) -> bool {
        !self.exhausted && self.paging.as_ref().is_some_and(|p| !p.before.is_empty())
    }

    /// Whether an older-history request came back empty since the last
    /// full refresh.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Anchor for a `Before` request: the oldest confirmed message, or the
    /// stored cursor when nothing is confirmed yet.
    #[must_use]
    pub fn before_anchor(&self) -> Option<String> {
        self.original_messages
            .iter()
            .rev()
            .find_map(|m| m.remote_id)
            .map(|id| id.to_string())
            .or_else(|| {
                self.paging
                    .as_ref()
                    .map(|p| p.before.clone())
                    .filter(|b| !b.is_empty())
            })
    }

    /// Anchor for an `After` request: the newest confirmed message, or the
    /// stored cursor.
    #[must_use]
    pub fn after_anchor(&self) -> Option<String> {
        self.original_messages
            .iter()
            .find_map(|m| m.remote_id)
            .map(|id| id.to_string())
            .or_else(|| {
                self.paging
                    .as_ref()
                    .map(|p| p.after.clone())
                    .filter(|a| !a.is_empty())
            })
    }

    /// Whether a message with the same identity is known.
    #[must_use]
    pub fn contains(&self, message: &Message) -> bool {
        message.has_identity() && self.original_messages.iter().any(|m| m.is_same(message))
    }

    /// Insert a single message at its place in the newest-first list.
    ///
    /// Returns `false` if the identity is already known.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message) {
            return false;
        }
        let at = self
            .original_messages
            .iter()
            .position(|m| m.time <= message.time)
            .unwrap_or(self.original_messages.len());
        self.original_messages.insert(at, message);
        true
    }

    /// The newest message, if any.
    #[must_use]
    pub fn newest(&self) -> Option<&Message> {
        self.original_messages.first()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self {
            epoch: self.epoch + 1,
            ..Self::default()
        };
    }
}

fn dedup(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for message in messages {
        if !message.has_identity() || !out.iter().any(|m| m.is_same(&message)) {
            out.push(message);
        }
    }
    out
}
