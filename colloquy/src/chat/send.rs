//! Outgoing side of the conversation: the send lifecycle and the user's
//! typing signals.
//!
//! A composed message is validated, added locally as `Pending`, and handed
//! to the transport. The returned server id confirms it (`Success`); any
//! failure marks it `Failed`, where it stays visible until
//! [`MessagesManager::resend`] is called. There is no automatic retry.

use std::sync::Arc;

use tokio::time::Instant;

use colloquy_proto::message::{
    DeliveryStatus, LocalId, MediaUpload, Message, RemoteId, SendStatus,
};

use super::history::MessageStore;
use super::typing::TypingSignal;
use super::{ChatError, ChatEvent, MessagesManager};
use crate::transport::Transport;

impl<T: Transport + 'static, S: MessageStore + 'static> MessagesManager<T, S> {
    /// Send a text message.
    ///
    /// Returns the message in its final state: `Success` with a server id,
    /// or `Failed` if the network was unreachable or the transport call
    /// failed. Backend notifications are forwarded as
    /// [`ChatEvent::Notice`].
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] if the text is empty or too long;
    /// nothing is created in that case.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<Message, ChatError> {
        let message = Message::user_text(text);
        message.validate()?;
        self.user_stopped_typing();
        Ok(self.submit(message).await)
    }

    /// Send the text of a tapped quick reply.
    ///
    /// The quick-reply slot clears as soon as the reply becomes the newest
    /// message.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_message`].
    pub async fn send_quick_reply(&self, text: impl Into<String>) -> Result<Message, ChatError> {
        let text = text.into();
        tracing::debug!(reply = %text, "sending quick reply");
        self.send_message(text).await
    }

    /// Upload media and send it as a message.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for an oversized or unsupported
    /// upload, [`ChatError::Offline`] when unreachable and
    /// [`ChatError::Transport`] if the upload failed. No message is
    /// created in any of these cases, since there is nothing to show
    /// without an uploaded media reference.
    pub async fn send_media(&self, upload: MediaUpload) -> Result<Message, ChatError> {
        upload.validate(self.config.max_media_size)?;
        if !self.reachability.is_connected().await {
            return Err(ChatError::Offline);
        }
        let media = self
            .transport
            .upload_media(&upload)
            .await
            .inspect_err(|e| self.surface(e))?;
        tracing::debug!(media_id = %media.id, size = upload.data.len(), "media uploaded");
        Ok(self.submit(Message::user_media(media)).await)
    }

    /// Send a failed message again.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotFound`] unless `local_id` names a message in
    /// the `Failed` state.
    pub async fn resend(&self, local_id: LocalId) -> Result<Message, ChatError> {
        let message = {
            let mut inner = self.state.lock().await;
            let Some(message) = inner
                .conversation
                .original_messages
                .iter_mut()
                .find(|m| m.local_id == Some(local_id) && m.is_unconfirmed())
                .filter(|m| m.send_status == SendStatus::Failed)
            else {
                return Err(ChatError::NotFound(local_id));
            };
            message.send_status = SendStatus::Pending;
            let message = message.clone();
            self.history.update(&message).await;
            if let Some(position) = inner.collection.update(message.clone()) {
                self.emit(ChatEvent::Update {
                    position,
                    message: message.clone(),
                });
            }
            message
        };

        tracing::info!(%local_id, "resending message");
        if !self.reachability.is_connected().await {
            return Ok(self.mark_failed(local_id).await.unwrap_or(message));
        }
        Ok(self.deliver(local_id, message).await)
    }

    /// Record a keystroke. Fires `startTyping` at the start of a burst and
    /// arms the idle timer that fires `stopTyping`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn user_did_type(&self) {
        let (signal, generation, delay) = {
            let mut typing = self.typing.lock();
            let signal = typing.throttle.did_type(Instant::now());
            typing.generation += 1;
            (signal, typing.generation, typing.throttle.stop_delay())
        };
        if let Some(signal) = signal {
            self.fire(signal);
        }

        let typing = Arc::clone(&self.typing);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let signal = {
                let mut typing = typing.lock();
                if typing.generation != generation {
                    return;
                }
                typing.throttle.idle_check(Instant::now())
            };
            if let Some(signal) = signal {
                fire_signal(transport.as_ref(), signal).await;
            }
        });
    }

    /// The user stopped typing (cleared the input, left the screen).
    ///
    /// Must be called from within a tokio runtime.
    pub fn user_stopped_typing(&self) {
        let signal = {
            let mut typing = self.typing.lock();
            typing.generation += 1;
            typing.throttle.stopped()
        };
        if let Some(signal) = signal {
            self.fire(signal);
        }
    }

    fn fire(&self, signal: TypingSignal) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            fire_signal(transport.as_ref(), signal).await;
        });
    }

    /// Add a locally composed message and run it through the transport.
    async fn submit(&self, message: Message) -> Message {
        let Some(local_id) = message.local_id else {
            return message;
        };
        self.add_local(message.clone()).await;

        if !self.reachability.is_connected().await {
            tracing::info!(%local_id, "offline, message marked failed");
            return self.mark_failed(local_id).await.unwrap_or(message);
        }
        self.deliver(local_id, message).await
    }

    async fn add_local(&self, message: Message) {
        let mut inner = self.state.lock().await;
        inner.conversation.insert(message.clone());
        self.history.insert(&message, true).await;
        let position = inner.collection.add(message.clone());
        self.emit(ChatEvent::Add { position, message });
        self.refresh_quick_replies(&mut inner);
    }

    async fn deliver(&self, local_id: LocalId, message: Message) -> Message {
        match self.transport.send_message(&message).await {
            Ok(remote_id) => {
                tracing::info!(%local_id, %remote_id, "message confirmed");
                self.confirm(local_id, remote_id).await.unwrap_or(message)
            }
            Err(e) => {
                self.surface(&e);
                tracing::warn!(%local_id, error = %e, "send failed, message marked failed");
                self.mark_failed(local_id).await.unwrap_or(message)
            }
        }
    }

    /// Attach the server id. A pushed echo that already carries this id
    /// is removed so the message appears once.
    async fn confirm(&self, local_id: LocalId, remote_id: RemoteId) -> Option<Message> {
        let mut inner = self.state.lock().await;
        let messages = &mut inner.conversation.original_messages;

        let echo = messages
            .iter()
            .position(|m| m.remote_id == Some(remote_id) && m.local_id != Some(local_id))
            .map(|i| messages.remove(i));

        let Some(message) = messages.iter_mut().find(|m| m.local_id == Some(local_id)) else {
            tracing::debug!(%local_id, "confirmed message no longer present");
            return None;
        };
        message.remote_id = Some(remote_id);
        message.send_status = SendStatus::Success;
        if self.config.api_version.supports_delivery_status() {
            message.delivery_status = Some(DeliveryStatus::Sent);
        }
        let message = message.clone();

        if let Some(echo) = echo {
            tracing::debug!(%remote_id, "dropped pushed echo of confirmed message");
            inner.collection.remove(&echo);
            self.history.save(&inner.conversation.original_messages).await;
            self.project(&mut inner);
        } else {
            self.history.update(&message).await;
            if let Some(position) = inner.collection.update(message.clone()) {
                self.emit(ChatEvent::Update {
                    position,
                    message: message.clone(),
                });
            }
            self.refresh_quick_replies(&mut inner);
        }
        Some(message)
    }

    async fn mark_failed(&self, local_id: LocalId) -> Option<Message> {
        let mut inner = self.state.lock().await;
        let message = inner
            .conversation
            .original_messages
            .iter_mut()
            .find(|m| m.local_id == Some(local_id))?;
        message.send_status = SendStatus::Failed;
        let message = message.clone();

        self.history.update(&message).await;
        if let Some(position) = inner.collection.update(message.clone()) {
            self.emit(ChatEvent::Update {
                position,
                message: message.clone(),
            });
        }
        Some(message)
    }
}

async fn fire_signal<T: Transport>(transport: &T, signal: TypingSignal) {
    let event = signal.event();
    match transport.fire_event(event).await {
        Ok(()) => tracing::debug!(%event, "typing event sent"),
        Err(e) => tracing::warn!(%event, error = %e, "typing event failed"),
    }
}
