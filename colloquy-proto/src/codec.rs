//! Stored representation of messages and conversation snapshots.
//!
//! Uses postcard for a compact binary encoding. Every blob starts with a
//! one-byte format version so that stores written by an older build are
//! rejected instead of misread.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Current stored-format version.
pub const STORE_FORMAT_VERSION: u8 = 1;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The blob was written with a different format version.
    #[error("unsupported store format version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version byte found in the blob.
        found: u8,
        /// Version this build writes.
        expected: u8,
    },
    /// The blob is empty.
    #[error("empty blob")]
    Empty,
    /// Synthetic presentation messages are never stored.
    #[error("synthetic messages cannot be persisted")]
    NotPersistable,
}

/// Everything a store needs to resume a conversation after restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Conversation messages, newest first.
    pub messages: Vec<Message>,
    /// String key/value pairs (welcome message, paging cursor, ...).
    pub values: BTreeMap<String, String>,
}

fn with_version(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(STORE_FORMAT_VERSION);
    out.extend_from_slice(payload);
    out
}

fn strip_version(bytes: &[u8]) -> Result<&[u8], CodecError> {
    let (&version, rest) = bytes.split_first().ok_or(CodecError::Empty)?;
    if version != STORE_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: version,
            expected: STORE_FORMAT_VERSION,
        });
    }
    Ok(rest)
}

/// Encodes one message into its stored form.
///
/// # Errors
///
/// Returns [`CodecError::NotPersistable`] for synthetic messages, or
/// [`CodecError::Serialization`] if postcard fails.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, CodecError> {
    if message.is_synthetic() {
        return Err(CodecError::NotPersistable);
    }
    let payload =
        postcard::to_allocvec(message).map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(with_version(&payload))
}

/// Decodes one message from its stored form.
///
/// # Errors
///
/// Returns [`CodecError`] on a version mismatch or malformed bytes.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    let payload = strip_version(bytes)?;
    postcard::from_bytes(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a full snapshot. Synthetic messages are dropped.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if postcard fails.
pub fn encode_snapshot(snapshot: &StoreSnapshot) -> Result<Vec<u8>, CodecError> {
    let filtered = StoreSnapshot {
        messages: snapshot
            .messages
            .iter()
            .filter(|m| !m.is_synthetic())
            .cloned()
            .collect(),
        values: snapshot.values.clone(),
    };
    let payload =
        postcard::to_allocvec(&filtered).map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(with_version(&payload))
}

/// Decodes a full snapshot.
///
/// # Errors
///
/// Returns [`CodecError`] on a version mismatch or malformed bytes.
pub fn decode_snapshot(bytes: &[u8]) -> Result<StoreSnapshot, CodecError> {
    let payload = strip_version(bytes)?;
    postcard::from_bytes(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}
