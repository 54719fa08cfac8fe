//! Incoming side of the conversation: pushed messages, agent typing and
//! read acknowledgements.

use std::sync::Arc;

use colloquy_proto::message::{Message, MessageType, RemoteId};
use colloquy_proto::wire;

use super::history::MessageStore;
use super::{ChatError, ChatEvent, Inner, MessagesManager};
use crate::transport::Transport;

const fn is_agent_authored(message_type: MessageType) -> bool {
    matches!(
        message_type,
        MessageType::Agent | MessageType::Auto | MessageType::SystemAgent
    )
}

impl<T: Transport + 'static, S: MessageStore + 'static> MessagesManager<T, S> {
    /// Add a message pushed by the service.
    ///
    /// A message whose identity is already known is dropped without any
    /// event. An agent-authored message also clears the agent typing row.
    /// Messages carrying quick replies are stored but not shown as rows;
    /// they only feed the quick-reply slot. Returns whether the message
    /// was new.
    pub async fn handle_new_message(&self, message: Message) -> bool {
        if message.is_synthetic() || !message.has_identity() {
            tracing::debug!(kind = ?message.message_type, "ignoring message without identity");
            return false;
        }

        let mut inner = self.state.lock().await;
        if inner.conversation.contains(&message) {
            tracing::debug!(
                remote_id = ?message.remote_id,
                local_id = ?message.local_id,
                "duplicate message dropped"
            );
            return false;
        }

        if is_agent_authored(message.message_type) {
            self.set_agent_typing(&mut inner, false);
        }

        inner.conversation.insert(message.clone());
        let is_newest = inner
            .conversation
            .newest()
            .is_some_and(|m| m.is_same(&message));
        if is_newest {
            self.history.insert(&message, true).await;
        } else {
            self.history.save(&inner.conversation.original_messages).await;
        }

        if !message.has_quick_replies() {
            let position = inner.collection.add(message.clone());
            self.emit(ChatEvent::Add { position, message });
        }
        self.refresh_quick_replies(&mut inner);
        true
    }

    /// Decode a pushed JSON payload and add it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Decode`] if the payload is malformed; nothing
    /// is changed in that case.
    pub async fn handle_pushed_payload(&self, body: &str) -> Result<bool, ChatError> {
        let message = wire::decode_pushed(body, self.config.api_version)?;
        Ok(self.handle_new_message(message).await)
    }

    /// The agent started typing. The row disappears by itself after the
    /// configured timeout unless another signal or message arrives.
    pub async fn handle_agent_began_typing(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.state.lock().await;
            self.set_agent_typing(&mut inner, true);
            inner.agent_typing_generation
        };

        let manager = Arc::downgrade(self);
        let timeout = self.config.agent_typing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let mut inner = manager.state.lock().await;
            if inner.agent_typing_generation == generation {
                tracing::debug!("agent typing timed out");
                manager.set_agent_typing(&mut inner, false);
            }
        });
    }

    /// The agent stopped typing.
    pub async fn handle_agent_stopped_typing(&self) {
        let mut inner = self.state.lock().await;
        self.set_agent_typing(&mut inner, false);
    }

    /// The user has seen the message with `id`. Acknowledgements are
    /// batched and sent after a quiet period.
    pub async fn handle_message_read(&self, id: RemoteId) {
        self.receipts.queue_message_read(id);
    }

    /// Every call invalidates a running auto-stop timer; the event only
    /// fires on an actual change.
    fn set_agent_typing(&self, inner: &mut Inner, typing: bool) {
        inner.agent_typing_generation += 1;
        if inner.agent_typing != typing {
            inner.agent_typing = typing;
            self.emit(ChatEvent::AgentTyping(typing));
        }
    }
}
