//! Transport layer abstraction for Colloquy.
//!
//! Defines the [`Transport`] trait the engine talks to the remote message
//! service through. The concrete HTTP client lives outside this crate;
//! [`loopback::LoopbackService`] is an in-process implementation used by
//! the tests and the demo binary.

pub mod loopback;

use std::collections::BTreeSet;
use std::fmt;

use colloquy_proto::event::EventName;
use colloquy_proto::message::{MediaRef, MediaUpload, Message, RemoteId};
use colloquy_proto::wire::{DecodeError, ErrorEnvelope, MessageCollection, Notification};

/// Which slice of history a fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageMode {
    /// The newest page; replaces what is loaded.
    All,
    /// Messages older than the cursor.
    Before,
    /// Messages newer than the cursor.
    After,
}

impl fmt::Display for PageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Before => write!(f, "before"),
            Self::After => write!(f, "after"),
        }
    }
}

/// A history fetch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Slice of history to fetch.
    pub mode: PageMode,
    /// Opaque anchor for `Before` / `After`.
    pub cursor: Option<String>,
}

impl FetchRequest {
    /// Request for the newest page.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            mode: PageMode::All,
            cursor: None,
        }
    }
}

/// A structured error returned by the service, surfaced verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendError {
    /// HTTP-level status code.
    pub status_code: u16,
    /// Decoded error body.
    pub envelope: ErrorEnvelope,
}

impl BackendError {
    /// Notifications meant for the user.
    #[must_use]
    pub fn notifications(&self) -> &[Notification] {
        &self.envelope.notifications
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status_code, self.envelope.status)?;
        for notification in &self.envelope.notifications {
            write!(f, ": {}", notification.message)?;
        }
        Ok(())
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No response reached us (offline, DNS, reset, ...).
    #[error("connection failed: {0}")]
    Connection(String),

    /// The service answered with a structured error.
    #[error("backend error: {0}")]
    Backend(BackendError),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Async contract of the remote message service.
///
/// Every method may suspend; none of them retry on their own.
pub trait Transport: Send + Sync {
    /// Store a message remotely, returning the server-assigned id.
    fn send_message(
        &self,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<RemoteId, TransportError>> + Send;

    /// Fetch a page of history.
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl std::future::Future<Output = Result<MessageCollection, TransportError>> + Send;

    /// Upload media, returning a reference usable in a message.
    fn upload_media(
        &self,
        upload: &MediaUpload,
    ) -> impl std::future::Future<Output = Result<MediaRef, TransportError>> + Send;

    /// Download previously uploaded media.
    fn fetch_media(
        &self,
        media: &MediaRef,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Fire a named side-channel event.
    fn fire_event(
        &self,
        event: EventName,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Acknowledge that messages were read.
    fn mark_read(
        &self,
        ids: &BTreeSet<RemoteId>,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}
