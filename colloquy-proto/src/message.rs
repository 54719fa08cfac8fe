//! Domain message types for the Colloquy conversation model.
//!
//! A [`Message`] is the atomic conversational item. It is created locally
//! when the user composes something, decoded from a server payload (see
//! [`crate::wire`]), or synthesized by the engine for presentation (date
//! separators, typing indicator, loading placeholder, info rows).

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed length of a composed text message, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 5000;

/// Default maximum size of an uploaded media payload (10 MiB).
pub const DEFAULT_MAX_MEDIA_SIZE: usize = 10 * 1024 * 1024;

/// Media types accepted for upload.
pub const SUPPORTED_MEDIA_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

/// Process-generated identity of a locally composed message (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Creates a new time-ordered local identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `LocalId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(i64);

impl RemoteId {
    /// Wraps a raw server id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw server id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Creates a timestamp from whole seconds since the UNIX epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp truncated to whole seconds.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Converts to a `chrono` UTC date-time.
    #[must_use]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        i64::try_from(self.0)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }

    /// The calendar day this instant falls on in the given UTC offset.
    #[must_use]
    pub fn day_in(&self, offset: FixedOffset) -> NaiveDate {
        self.to_datetime().with_timezone(&offset).date_naive()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of conversational item.
///
/// The first five variants travel on the wire (`typeId` 1..=5); the rest
/// are synthesized locally for presentation and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Written by the local user.
    User,
    /// Written by a human agent.
    Agent,
    /// Sent by an automated responder.
    Auto,
    /// System message on behalf of the user.
    SystemUser,
    /// System message on behalf of the agent.
    SystemAgent,
    /// Day separator row.
    Date,
    /// "Loading older messages" placeholder.
    Loading,
    /// Agent-is-typing indicator row.
    AgentTyping,
    /// Informational row (welcome text and similar).
    Info,
}

impl MessageType {
    /// Maps a wire `typeId` to a message type.
    #[must_use]
    pub const fn from_type_id(type_id: u8) -> Option<Self> {
        match type_id {
            1 => Some(Self::User),
            2 => Some(Self::Agent),
            3 => Some(Self::Auto),
            4 => Some(Self::SystemUser),
            5 => Some(Self::SystemAgent),
            _ => None,
        }
    }

    /// The wire `typeId`, or `None` for locally synthesized kinds.
    #[must_use]
    pub const fn type_id(self) -> Option<u8> {
        match self {
            Self::User => Some(1),
            Self::Agent => Some(2),
            Self::Auto => Some(3),
            Self::SystemUser => Some(4),
            Self::SystemAgent => Some(5),
            Self::Date | Self::Loading | Self::AgentTyping | Self::Info => None,
        }
    }

    /// Whether this kind is only ever produced locally for presentation.
    #[must_use]
    pub const fn is_synthetic(self) -> bool {
        self.type_id().is_none()
    }
}

/// Local delivery lifecycle of a user-authored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendStatus {
    /// The send attempt failed; the message can be resent.
    Failed,
    /// Created locally, not yet confirmed by the server.
    Pending,
    /// Confirmed by the server.
    Success,
}

impl SendStatus {
    /// Maps a wire `status` code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Failed),
            1 => Some(Self::Pending),
            2 => Some(Self::Success),
            _ => None,
        }
    }

    /// The wire `status` code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Failed => 0,
            Self::Pending => 1,
            Self::Success => 2,
        }
    }
}

/// Remote delivery state, reported only by newer protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Accepted by the service.
    Sent,
    /// Delivered to the other side.
    Received,
    /// Read by the other side.
    Read,
}

impl DeliveryStatus {
    /// Maps a wire `deliveryStatus` code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Sent),
            2 => Some(Self::Received),
            3 => Some(Self::Read),
            _ => None,
        }
    }

    /// The wire `deliveryStatus` code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Sent => 1,
            Self::Received => 2,
            Self::Read => 3,
        }
    }
}

/// Reference to media stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef {
    /// Opaque media identifier.
    pub id: String,
    /// MIME type, if the service reported one.
    pub mime_type: Option<String>,
}

/// What an action button does when tapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ButtonKind {
    /// Sends `payload` back as a reply.
    Reply,
    /// Opens `payload` as a URL.
    WebUrl,
    /// Dials `payload`.
    PhoneNumber,
}

/// An action button attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Label shown to the user.
    pub title: String,
    /// Reply text, URL or phone number depending on `kind`.
    pub payload: Option<String>,
    /// Button behavior.
    pub kind: ButtonKind,
}

/// The agent responding in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Server-side agent id.
    pub id: i64,
    /// Display name.
    pub name: Option<String>,
    /// Avatar path or URL.
    pub avatar: Option<String>,
}

/// A conversational item.
///
/// Identity is carried by `local_id` (locally composed messages) and
/// `remote_id` (server-confirmed messages); see [`Message::is_same`].
/// The derived `PartialEq` compares every field and is meant for value
/// comparison, not for conversational identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identity assigned at local creation.
    pub local_id: Option<LocalId>,
    /// Identity assigned by the server.
    pub remote_id: Option<RemoteId>,
    /// Ordering timestamp.
    pub time: Timestamp,
    /// Optional title.
    pub title: Option<String>,
    /// Optional body text.
    pub message: Option<String>,
    /// Optional media attachment.
    pub media: Option<MediaRef>,
    /// Action buttons.
    pub buttons: Vec<Button>,
    /// Nested carousel items, in display order.
    pub carousel: Vec<Message>,
    /// Suggested replies attached to this message.
    pub quick_replies: Vec<String>,
    /// Referrer URL the message was composed from.
    pub referrer: Option<String>,
    /// Kind of item.
    pub message_type: MessageType,
    /// Local send lifecycle.
    pub send_status: SendStatus,
    /// Remote delivery state, when the protocol reports one.
    pub delivery_status: Option<DeliveryStatus>,
    /// Responding agent.
    pub agent: Option<Agent>,
}

/// Error returned when a message or upload fails local validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message has no content.
    #[error("message content is empty")]
    Empty,
    /// Text exceeds [`MAX_MESSAGE_LENGTH`].
    #[error("message too long ({len} characters, max {max})")]
    TooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
    /// Media payload exceeds the configured maximum.
    #[error("media too large ({size} bytes, max {max} bytes)")]
    MediaTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Media type is not one of [`SUPPORTED_MEDIA_TYPES`].
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
}

impl Message {
    fn blank(message_type: MessageType, time: Timestamp) -> Self {
        Self {
            local_id: None,
            remote_id: None,
            time,
            title: None,
            message: None,
            media: None,
            buttons: Vec::new(),
            carousel: Vec::new(),
            quick_replies: Vec::new(),
            referrer: None,
            message_type,
            send_status: SendStatus::Success,
            delivery_status: None,
            agent: None,
        }
    }

    /// A new locally composed text message in the `Pending` state.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            local_id: Some(LocalId::new()),
            message: Some(text.into()),
            send_status: SendStatus::Pending,
            ..Self::blank(MessageType::User, Timestamp::now())
        }
    }

    /// A new locally composed media message in the `Pending` state.
    #[must_use]
    pub fn user_media(media: MediaRef) -> Self {
        Self {
            local_id: Some(LocalId::new()),
            media: Some(media),
            send_status: SendStatus::Pending,
            ..Self::blank(MessageType::User, Timestamp::now())
        }
    }

    /// A server-side message, as produced by the decoder.
    #[must_use]
    pub fn remote(id: RemoteId, message_type: MessageType, time: Timestamp) -> Self {
        Self {
            remote_id: Some(id),
            ..Self::blank(message_type, time)
        }
    }

    /// Synthetic day separator for the day containing `time`.
    #[must_use]
    pub fn date_separator(time: Timestamp) -> Self {
        Self::blank(MessageType::Date, time)
    }

    /// Synthetic "loading older messages" placeholder.
    #[must_use]
    pub fn loading() -> Self {
        Self::blank(MessageType::Loading, Timestamp::now())
    }

    /// Synthetic agent-is-typing row.
    #[must_use]
    pub fn agent_typing() -> Self {
        Self::blank(MessageType::AgentTyping, Timestamp::now())
    }

    /// Synthetic informational row.
    #[must_use]
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::blank(MessageType::Info, Timestamp::now())
        }
    }

    /// Whether `self` and `other` are the same conversational item.
    ///
    /// True if both carry a matching `local_id`, or both carry a matching
    /// `remote_id`. Items without identity are never the same as anything.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        let local = matches!((self.local_id, other.local_id), (Some(a), Some(b)) if a == b);
        let remote = matches!((self.remote_id, other.remote_id), (Some(a), Some(b)) if a == b);
        local || remote
    }

    /// Whether this message carries any identity at all.
    #[must_use]
    pub const fn has_identity(&self) -> bool {
        self.local_id.is_some() || self.remote_id.is_some()
    }

    /// Whether the server has assigned an id.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Whether this message is engine-generated presentation scaffolding.
    #[must_use]
    pub const fn is_synthetic(&self) -> bool {
        self.message_type.is_synthetic()
    }

    /// A user-authored message the server has not confirmed yet
    /// (`Pending` or `Failed`).
    #[must_use]
    pub fn is_unconfirmed(&self) -> bool {
        self.message_type == MessageType::User
            && self.remote_id.is_none()
            && self.send_status != SendStatus::Success
    }

    /// Whether quick replies are attached.
    #[must_use]
    pub fn has_quick_replies(&self) -> bool {
        !self.quick_replies.is_empty()
    }


    /// Validates a locally composed message for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if there is neither text nor
    /// media, or [`ValidationError::TooLong`] if the text exceeds
    /// [`MAX_MESSAGE_LENGTH`] characters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let text = self.message.as_deref().map(str::trim).unwrap_or_default();
        if text.is_empty() && self.media.is_none() {
            return Err(ValidationError::Empty);
        }
        let len = text.chars().count();
        if len > MAX_MESSAGE_LENGTH {
            return Err(ValidationError::TooLong {
                len,
                max: MAX_MESSAGE_LENGTH,
            });
        }
        Ok(())
    }
}

/// Raw media the user wants to attach, before upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    /// File contents.
    pub data: Vec<u8>,
    /// MIME type.
    pub mime_type: String,
}

impl MediaUpload {
    /// Validates the upload against size and type limits.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for an empty payload,
    /// [`ValidationError::MediaTooLarge`] above `max_size`, or
    /// [`ValidationError::UnsupportedMediaType`] for other MIME types.
    pub fn validate(&self, max_size: usize) -> Result<(), ValidationError> {
        if self.data.is_empty() {
            return Err(ValidationError::Empty);
        }
        if self.data.len() > max_size {
            return Err(ValidationError::MediaTooLarge {
                size: self.data.len(),
                max: max_size,
            });
        }
        if !SUPPORTED_MEDIA_TYPES.contains(&self.mime_type.as_str()) {
            return Err(ValidationError::UnsupportedMediaType(self.mime_type.clone()));
        }
        Ok(())
    }
}
