//! Property-based tests for the storage codec and the wire decoder.
//!
//! Uses proptest to verify:
//! 1. Any store snapshot survives encode -> decode.
//! 2. A message written to the wire and pushed back decodes to the same
//!    content.
//! 3. Random bytes never make the snapshot decoder panic.
//! 4. Random text never makes the JSON decoders panic.

use std::collections::BTreeMap;

use colloquy_proto::codec::{self, StoreSnapshot};
use colloquy_proto::message::{
    DeliveryStatus, LocalId, Message, MessageType, RemoteId, SendStatus, Timestamp,
};
use colloquy_proto::wire::{self, ApiVersion};
use proptest::prelude::*;
use uuid::Uuid;

// --- Strategies ---

fn arb_message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::User),
        Just(MessageType::Agent),
        Just(MessageType::Auto),
        Just(MessageType::SystemUser),
        Just(MessageType::SystemAgent),
    ]
}

fn arb_send_status() -> impl Strategy<Value = SendStatus> {
    prop_oneof![
        Just(SendStatus::Pending),
        Just(SendStatus::Success),
        Just(SendStatus::Failed),
    ]
}

fn arb_delivery_status() -> impl Strategy<Value = Option<DeliveryStatus>> {
    prop_oneof![
        Just(None),
        Just(Some(DeliveryStatus::Sent)),
        Just(Some(DeliveryStatus::Received)),
        Just(Some(DeliveryStatus::Read)),
    ]
}

/// Messages as the service would report them: always a remote id, time
/// in whole seconds.
fn arb_remote_message() -> impl Strategy<Value = Message> {
    (
        1..i64::MAX,
        0..4_000_000_000u64,
        arb_message_type(),
        proptest::option::of("[^\x00]{1,200}"),
        prop::collection::vec("[a-zA-Z ]{1,20}", 0..4),
        arb_send_status(),
        arb_delivery_status(),
    )
        .prop_map(|(id, secs, kind, text, replies, status, delivery)| {
            let mut message = Message::remote(RemoteId::new(id), kind, Timestamp::from_secs(secs));
            message.message = text;
            message.quick_replies = replies;
            message.send_status = status;
            message.delivery_status = delivery;
            message
        })
}

/// Messages as local storage holds them: either identity, millisecond
/// time.
fn arb_stored_message() -> impl Strategy<Value = Message> {
    (
        arb_remote_message(),
        proptest::option::of(any::<u128>()),
        any::<bool>(),
        any::<u64>(),
    )
        .prop_map(|(mut message, local, keep_remote, millis)| {
            message.local_id = local.map(|n| LocalId::from_uuid(Uuid::from_u128(n)));
            if !keep_remote && message.local_id.is_some() {
                message.remote_id = None;
            }
            message.time = Timestamp::from_millis(millis);
            message
        })
}

fn arb_snapshot() -> impl Strategy<Value = StoreSnapshot> {
    (
        prop::collection::vec(arb_stored_message(), 0..16),
        prop::collection::btree_map("[a-zA-Z]{1,16}", ".{0,64}", 0..4),
    )
        .prop_map(|(messages, values): (Vec<Message>, BTreeMap<String, String>)| {
            StoreSnapshot { messages, values }
        })
}

// --- Properties ---

proptest! {
    #[test]
    fn snapshot_round_trip(snapshot in arb_snapshot()) {
        let bytes = codec::encode_snapshot(&snapshot).unwrap();
        let decoded = codec::decode_snapshot(&bytes).unwrap();
        prop_assert_eq!(decoded, snapshot);
    }

    #[test]
    fn pushed_message_keeps_its_content(message in arb_remote_message()) {
        let body = serde_json::to_string(&wire::encode_message(&message)).unwrap();
        let decoded = wire::decode_pushed(&body, ApiVersion::V1_8).unwrap();

        prop_assert_eq!(decoded.remote_id, message.remote_id);
        prop_assert_eq!(decoded.time, message.time);
        prop_assert_eq!(decoded.message_type, message.message_type);
        prop_assert_eq!(&decoded.message, &message.message);
        prop_assert_eq!(&decoded.quick_replies, &message.quick_replies);
        prop_assert_eq!(decoded.send_status, message.send_status);
        prop_assert_eq!(decoded.delivery_status, message.delivery_status);
    }

    #[test]
    fn old_protocol_drops_delivery_status(message in arb_remote_message()) {
        let body = serde_json::to_string(&wire::encode_message(&message)).unwrap();
        let decoded = wire::decode_pushed(&body, ApiVersion::V1_6).unwrap();
        prop_assert_eq!(decoded.delivery_status, None);
    }

    #[test]
    fn random_bytes_never_panic_snapshot_decode(
        bytes in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let _ = codec::decode_snapshot(&bytes);
    }

    #[test]
    fn random_text_never_panics_wire_decode(body in ".{0,256}") {
        let _ = wire::decode_collection(&body, ApiVersion::V1_8);
        let _ = wire::decode_pushed(&body, ApiVersion::V1_8);
        let _ = wire::decode_error(&body);
    }
}
