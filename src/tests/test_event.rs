use std::sync::Arc;

use crate::{
    BitswarmError, Broadcast, ClientMessage, Snapshot, ToggleBatch, ToggleBatchBuilder,
    ToggleEvent, TotalBits,
};

fn bits(n: u64) -> TotalBits {
    TotalBits::try_from(n).unwrap()
}

#[test]
fn toggle_event_wire_form() {
    let event = ToggleEvent {
        index: 42,
        new_value: false,
        timestamp_ms: 1_700_000_000_123,
    };

    assert_eq!(event.encode(), "[42,0,1700000000123]");
    assert_eq!(
        ToggleEvent::decode("[42,0,1700000000123]", bits(100)).unwrap(),
        event
    );
}

#[test]
fn toggle_event_decode_rejects_bad_payloads() {
    for payload in ["", "hello", "[1,1]", "[1,2,3]", "[-1,1,3]", "[100,1,3]", "{}"] {
        assert!(
            matches!(
                ToggleEvent::decode(payload, bits(100)),
                Err(BitswarmError::MalformedEvent(_))
            ),
            "{payload} should be rejected"
        );
    }
}

#[test]
fn batch_keeps_final_state_per_index() {
    let mut builder = ToggleBatchBuilder::default();

    builder.push(ToggleEvent {
        index: 3,
        new_value: true,
        timestamp_ms: 10,
    });
    builder.push(ToggleEvent {
        index: 7,
        new_value: false,
        timestamp_ms: 20,
    });
    builder.push(ToggleEvent {
        index: 3,
        new_value: false,
        timestamp_ms: 30,
    });
    assert_eq!(builder.events(), 3);

    assert_eq!(
        builder.finish().unwrap(),
        ToggleBatch {
            true_indices: vec![],
            false_indices: vec![3, 7],
            timestamp: 30,
        }
    );
}

#[test]
fn batch_timestamp_is_the_maximum_not_the_last() {
    let mut builder = ToggleBatchBuilder::default();

    builder.push(ToggleEvent {
        index: 9,
        new_value: true,
        timestamp_ms: 50,
    });
    builder.push(ToggleEvent {
        index: 1,
        new_value: true,
        timestamp_ms: 40,
    });

    let batch = builder.finish().unwrap();
    assert_eq!(batch.true_indices, vec![1, 9]);
    assert_eq!(batch.timestamp, 50);
}

#[test]
fn empty_batch_is_none() {
    assert!(ToggleBatchBuilder::default().finish().is_none());
}

#[test]
fn broadcast_frames() {
    let batch = Broadcast::BatchedBitToggles(Arc::new(ToggleBatch {
        true_indices: vec![1, 2],
        false_indices: vec![5],
        timestamp: 99,
    }));
    assert_eq!(batch.event_name(), "batched_bit_toggles");
    assert_eq!(
        batch.to_message().unwrap(),
        r#"{"event":"batched_bit_toggles","data":[[1,2],[5],99]}"#
    );

    let full = Broadcast::FullState(Arc::new(Snapshot {
        full_state: "AA".to_string(),
        count: 0,
        timestamp: 7,
    }));
    assert_eq!(full.event_name(), "full_state");
    assert_eq!(
        full.to_message().unwrap(),
        r#"{"event":"full_state","data":{"full_state":"AA","count":0,"timestamp":7}}"#
    );

    let parsed: Broadcast = serde_json::from_str(&full.to_message().unwrap()).unwrap();
    assert_eq!(parsed, full);
}

#[test]
fn client_toggle_frame() {
    assert_eq!(
        ClientMessage::parse(r#"{"event":"toggle_bit","data":{"index":12}}"#).unwrap(),
        ClientMessage::ToggleBit { index: 12 }
    );
    assert_eq!(
        ClientMessage::parse(r#"{"event":"toggle_bit","data":{"index":-3}}"#).unwrap(),
        ClientMessage::ToggleBit { index: -3 }
    );

    assert!(matches!(
        ClientMessage::parse(r#"{"event":"unknown","data":{}}"#),
        Err(BitswarmError::JsonError(_))
    ));
    assert!(ClientMessage::parse("not json").is_err());
}
