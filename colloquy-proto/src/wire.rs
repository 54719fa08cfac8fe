//! JSON payload shapes exchanged with the remote message service.
//!
//! The service speaks camelCase JSON. Incoming payloads are parsed into the
//! `Wire*` structs and then converted into domain [`Message`]s by
//! [`decode_message`] / [`decode_collection`], which apply defaults and
//! reject shapes the engine cannot work with. [`encode_message`] produces
//! the body of an outgoing send request.

use serde::{Deserialize, Serialize};

use crate::message::{
    Agent, Button, ButtonKind, DeliveryStatus, MediaRef, Message, MessageType, RemoteId,
    SendStatus, Timestamp,
};

/// Protocol version spoken with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ApiVersion {
    /// `v1.6`: send status only.
    V1_6,
    /// `v1.7`: adds quick replies on every message type.
    V1_7,
    /// `v1.8`: adds delivery status tracking.
    #[default]
    V1_8,
}

impl ApiVersion {
    /// Whether `deliveryStatus` is reported by this version.
    #[must_use]
    pub fn supports_delivery_status(self) -> bool {
        self >= Self::V1_8
    }

    /// Path segment used by the service for this version.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::V1_6 => "v1.6",
            Self::V1_7 => "v1.7",
            Self::V1_8 => "v1.8",
        }
    }
}

impl std::str::FromStr for ApiVersion {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('v') {
            "1.6" => Ok(Self::V1_6),
            "1.7" => Ok(Self::V1_7),
            "1.8" => Ok(Self::V1_8),
            other => Err(DecodeError::UnknownVersion(other.to_string())),
        }
    }
}

/// Errors raised while turning a payload into domain values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not valid JSON for the expected shape.
    #[error("malformed payload: {0}")]
    Json(String),
    /// A top-level message has no `id` / `messageId`.
    #[error("message without id")]
    MissingId,
    /// A top-level message has no `typeId`.
    #[error("message {id} has no typeId")]
    MissingType {
        /// Id of the offending message.
        id: i64,
    },
    /// A carousel entry has no `typeId`.
    #[error("carousel entry {index} of message {parent:?} has no typeId")]
    MissingCarouselType {
        /// Id of the enclosing message, if any.
        parent: Option<i64>,
        /// Position of the entry in the carousel.
        index: usize,
    },
    /// `typeId` is not a known message type.
    #[error("unknown typeId {0}")]
    UnknownType(u8),
    /// `status` is not a known send status.
    #[error("unknown status {0}")]
    UnknownStatus(u8),
    /// `type` of a button is not a known button kind.
    #[error("unknown button type {0:?}")]
    UnknownButtonType(String),
    /// Version string not recognized.
    #[error("unknown api version {0:?}")]
    UnknownVersion(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Media object as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMedia {
    /// Media identifier.
    pub id: String,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Button as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireButton {
    /// Label.
    pub title: String,
    /// Reply text, URL or phone number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// `reply`, `webUrl` or `phoneNumber`; absent means `reply`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Agent as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAgent {
    /// Agent id.
    pub id: i64,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A single message as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Server id (`id`, or `messageId` in older payloads).
    #[serde(default, alias = "messageId", skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    /// Message type id (1..=5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<u8>,
    /// Send status code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    /// Delivery status code (v1.8+).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<u8>,
    /// Title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Attached media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<WireMedia>,
    /// Action buttons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<WireButton>,
    /// Carousel entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carousel: Vec<WireMessage>,
    /// Suggested replies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    /// Referrer URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Responding agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<WireAgent>,
}

/// Opaque paging tokens bounding the loaded history window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    /// Token for fetching older history; empty when there is none.
    #[serde(default)]
    pub before: String,
    /// Token for fetching newer history.
    #[serde(default)]
    pub after: String,
}

/// A page of messages as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCollection {
    /// Messages, newest first.
    #[serde(default)]
    pub data: Vec<WireMessage>,
    /// Current agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<WireAgent>,
    /// Paging tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging: Option<Paging>,
    /// Banner text shown independent of the timeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_message: Option<String>,
    /// Welcome text shown above the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub welcome_message: Option<String>,
}

/// A decoded page of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageCollection {
    /// Messages, newest first.
    pub messages: Vec<Message>,
    /// Current agent.
    pub agent: Option<Agent>,
    /// Paging tokens.
    pub paging: Paging,
    /// Sticky banner text.
    pub sticky_message: Option<String>,
    /// Welcome text.
    pub welcome_message: Option<String>,
}

/// One user-facing notification inside an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Severity (`error`, `warning`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable text.
    pub message: String,
}

/// Structured error body returned by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Status string (`ERROR`, ...).
    #[serde(default)]
    pub status: String,
    /// Notifications to show the user.
    #[serde(default)]
    pub notifications: Vec<Notification>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn decode_button(button: WireButton) -> Result<Button, DecodeError> {
    let kind = match button.kind.as_deref() {
        None | Some("reply") => ButtonKind::Reply,
        Some("webUrl") => ButtonKind::WebUrl,
        Some("phoneNumber") => ButtonKind::PhoneNumber,
        Some(other) => return Err(DecodeError::UnknownButtonType(other.to_string())),
    };
    Ok(Button {
        title: button.title,
        payload: button.payload,
        kind,
    })
}

fn decode_agent(agent: WireAgent) -> Agent {
    Agent {
        id: agent.id,
        name: agent.name,
        avatar: agent.avatar,
    }
}

fn decode_body(
    wire: WireMessage,
    message_type: MessageType,
    remote_id: Option<RemoteId>,
    version: ApiVersion,
    now: Timestamp,
) -> Result<Message, DecodeError> {
    let parent = wire.id;
    let send_status = match wire.status {
        None => SendStatus::Success,
        Some(code) => SendStatus::from_code(code).ok_or(DecodeError::UnknownStatus(code))?,
    };
    let delivery_status = if version.supports_delivery_status() {
        wire.delivery_status.and_then(DeliveryStatus::from_code)
    } else {
        None
    };

    let carousel = wire
        .carousel
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let type_id = entry
                .type_id
                .ok_or(DecodeError::MissingCarouselType { parent, index })?;
            let kind = MessageType::from_type_id(type_id).ok_or(DecodeError::UnknownType(type_id))?;
            let id = entry.id.map(RemoteId::new);
            decode_body(entry, kind, id, version, now)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let buttons = wire
        .buttons
        .into_iter()
        .map(decode_button)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Message {
        local_id: None,
        remote_id,
        time: wire.time.map_or(now, Timestamp::from_secs),
        title: wire.title,
        message: wire.message,
        media: wire.media.map(|m| MediaRef {
            id: m.id,
            mime_type: m.mime_type,
        }),
        buttons,
        carousel,
        quick_replies: wire.quick_replies,
        referrer: wire.referrer,
        message_type,
        send_status,
        delivery_status,
        agent: wire.agent.map(decode_agent),
    })
}

/// Converts a wire message into a domain message.
///
/// `now` is used when the payload carries no `time`. Delivery status is
/// only kept when `version` reports it.
///
/// # Errors
///
/// Fails on a missing id or `typeId`, on a carousel entry without
/// `typeId`, and on unknown type, status or button codes.
pub fn decode_message(
    wire: WireMessage,
    version: ApiVersion,
    now: Timestamp,
) -> Result<Message, DecodeError> {
    let id = wire.id.ok_or(DecodeError::MissingId)?;
    let type_id = wire.type_id.ok_or(DecodeError::MissingType { id })?;
    let kind = MessageType::from_type_id(type_id).ok_or(DecodeError::UnknownType(type_id))?;
    decode_body(wire, kind, Some(RemoteId::new(id)), version, now)
}

/// Parses and decodes a collection response body.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] for malformed JSON, or any error from
/// [`decode_message`]. A single bad message fails the whole page so that
/// nothing partial is merged.
pub fn decode_collection(
    body: &str,
    version: ApiVersion,
) -> Result<MessageCollection, DecodeError> {
    let wire: WireCollection = serde_json::from_str(body)?;
    let now = Timestamp::now();
    let messages = wire
        .data
        .into_iter()
        .map(|m| decode_message(m, version, now))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MessageCollection {
        messages,
        agent: wire.agent.map(decode_agent),
        paging: wire.paging.unwrap_or_default(),
        sticky_message: wire.sticky_message,
        welcome_message: wire.welcome_message,
    })
}

/// Parses a single pushed message body.
///
/// # Errors
///
/// Same as [`decode_message`], plus [`DecodeError::Json`].
pub fn decode_pushed(body: &str, version: ApiVersion) -> Result<Message, DecodeError> {
    let wire: WireMessage = serde_json::from_str(body)?;
    decode_message(wire, version, Timestamp::now())
}

/// Parses an error envelope.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] if the body is not an error envelope.
pub fn decode_error(body: &str) -> Result<ErrorEnvelope, DecodeError> {
    Ok(serde_json::from_str(body)?)
}

/// Converts a domain message into its wire form.
///
/// Synthetic messages have no `typeId` and are encoded without one.
#[must_use]
pub fn encode_message(message: &Message) -> WireMessage {
    WireMessage {
        id: message.remote_id.map(RemoteId::get),
        time: Some(message.time.as_secs()),
        type_id: message.message_type.type_id(),
        status: Some(message.send_status.code()),
        delivery_status: message.delivery_status.map(DeliveryStatus::code),
        title: message.title.clone(),
        message: message.message.clone(),
        media: message.media.as_ref().map(|m| WireMedia {
            id: m.id.clone(),
            mime_type: m.mime_type.clone(),
        }),
        buttons: message
            .buttons
            .iter()
            .map(|b| WireButton {
                title: b.title.clone(),
                payload: b.payload.clone(),
                kind: Some(
                    match b.kind {
                        ButtonKind::Reply => "reply",
                        ButtonKind::WebUrl => "webUrl",
                        ButtonKind::PhoneNumber => "phoneNumber",
                    }
                    .to_string(),
                ),
            })
            .collect(),
        carousel: message.carousel.iter().map(encode_message).collect(),
        quick_replies: message.quick_replies.clone(),
        referrer: message.referrer.clone(),
        agent: message.agent.as_ref().map(|a| WireAgent {
            id: a.id,
            name: a.name.clone(),
            avatar: a.avatar.clone(),
        }),
    }
}
