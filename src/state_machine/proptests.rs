//! Property-based tests for the session state machine
//!
//! These tests verify key invariants hold across arbitrary event sequences.

#![allow(clippy::single_match_else)]

use super::store::{ItemStatus, PartState};
use super::transition::*;
use super::*;
use crate::decoder::decode;
use crate::protocol::ClientEvent;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proptest::prelude::*;
use serde_json::{json, Value};

// ============================================================================
// Test Helpers
// ============================================================================

fn server(value: &Value) -> Event {
    Event::Server(decode(value.to_string().as_bytes()).unwrap())
}

fn apply(machine: &mut SessionMachine, value: &Value) -> Vec<Effect> {
    transition(machine, server(value)).unwrap().effects
}

fn truncates(effects: &[Effect]) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e, Effect::Send(ClientEvent::ConversationItemTruncate { .. })))
        .count()
}

/// Active response r1 with assistant message i1 and one open part.
fn open_part(machine: &mut SessionMachine, part_type: &str) {
    apply(machine, &json!({"type": "response.created", "response": {"id": "r1"}}));
    apply(
        machine,
        &json!({"type": "response.output_item.added", "response_id": "r1", "item": {
            "id": "i1", "type": "message", "role": "assistant", "status": "in_progress"
        }}),
    );
    apply(
        machine,
        &json!({"type": "response.content_part.added", "item_id": "i1", "content_index": 0,
                "part": {"type": part_type}}),
    );
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_fragment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ,.!?]{0,8}"
}

/// Events over a tiny id space so collisions and misorderings are common.
fn arb_server_event() -> impl Strategy<Value = Value> {
    let item = prop_oneof![Just("i1"), Just("i2")];
    let response = prop_oneof![Just("r1"), Just("r2")];
    prop_oneof![
        response.clone().prop_map(|id| json!({"type": "response.created", "response": {"id": id}})),
        response.prop_map(|id| json!({"type": "response.done", "response": {"id": id, "status": "completed"}})),
        item.clone().prop_map(|id| json!({"type": "response.output_item.added", "item": {
            "id": id, "type": "message", "role": "assistant"
        }})),
        item.clone().prop_map(|id| json!({"type": "response.content_part.added",
            "item_id": id, "content_index": 0, "part": {"type": "text"}})),
        (item.clone(), arb_fragment()).prop_map(|(id, delta)| json!({"type": "response.text.delta",
            "item_id": id, "content_index": 0, "delta": delta})),
        (item.clone(), arb_fragment()).prop_map(|(id, text)| json!({"type": "response.text.done",
            "item_id": id, "content_index": 0, "text": text})),
        item.clone().prop_map(|id| json!({"type": "response.output_item.done", "item": {
            "id": id, "type": "message", "role": "assistant", "status": "completed"
        }})),
        item.prop_map(|id| json!({"type": "conversation.item.truncated",
            "item_id": id, "content_index": 0, "audio_end_ms": 0})),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // The done payload is authoritative, whatever the deltas were
    #[test]
    fn prop_done_value_wins(
        deltas in proptest::collection::vec(arb_fragment(), 0..10),
        final_text in arb_fragment(),
    ) {
        let mut machine = SessionMachine::new();
        open_part(&mut machine, "text");
        for delta in &deltas {
            apply(&mut machine, &json!({"type": "response.text.delta",
                "item_id": "i1", "content_index": 0, "delta": delta}));
        }
        apply(&mut machine, &json!({"type": "response.text.done",
            "item_id": "i1", "content_index": 0, "text": final_text}));

        let part = machine.store().part("i1", 0).unwrap();
        prop_assert_eq!(&part.text, &final_text);
        prop_assert_eq!(part.state, PartState::Done);
    }

    // Deltas after done are rejected and change nothing
    #[test]
    fn prop_delta_after_done_does_not_mutate(
        final_text in arb_fragment(),
        late in proptest::collection::vec(arb_fragment(), 1..5),
    ) {
        let mut machine = SessionMachine::new();
        open_part(&mut machine, "text");
        apply(&mut machine, &json!({"type": "response.text.done",
            "item_id": "i1", "content_index": 0, "text": final_text}));
        let before = machine.store().clone();

        for delta in late {
            let result = transition(&mut machine, server(&json!({"type": "response.text.delta",
                "item_id": "i1", "content_index": 0, "delta": delta})));
            let is_terminal_violation = matches!(
                result,
                Err(crate::error::ProtocolViolation::DeltaAfterTerminal { .. })
            );
            prop_assert!(is_terminal_violation);
        }
        prop_assert_eq!(machine.store(), &before);
    }

    // A second response while one is active is rejected; the first is intact
    #[test]
    fn prop_nested_response_rejected(outputs in 0usize..4) {
        let mut machine = SessionMachine::new();
        apply(&mut machine, &json!({"type": "response.created", "response": {"id": "r1"}}));
        for i in 0..outputs {
            apply(&mut machine, &json!({"type": "response.output_item.added", "response_id": "r1",
                "item": {"id": format!("i{i}"), "type": "message", "role": "assistant"}}));
        }
        let before = machine.store().clone();

        let result = transition(&mut machine, server(&json!({"type": "response.created", "response": {"id": "r2"}})));
        let is_nested = matches!(result, Err(crate::error::ProtocolViolation::NestedResponse { .. }));
        prop_assert!(is_nested);
        prop_assert_eq!(machine.store(), &before);
        prop_assert_eq!(machine.store().active_response().unwrap().output.len(), outputs);
    }

    // Interrupting streaming audio truncates exactly once, whichever of
    // done and ack arrives first
    #[test]
    fn prop_interruption_truncates_once(
        chunks in 1usize..6,
        done_before_ack in any::<bool>(),
        extra_signals in 0usize..3,
    ) {
        let mut machine = SessionMachine::new();
        open_part(&mut machine, "audio");
        let chunk = BASE64.encode(vec![0u8; 480]);
        for _ in 0..chunks {
            apply(&mut machine, &json!({"type": "response.audio.delta",
                "item_id": "i1", "content_index": 0, "delta": chunk}));
        }

        let mut sent_truncates = truncates(&transition(&mut machine, Event::SpeechStarted).unwrap().effects);
        for _ in 0..extra_signals {
            sent_truncates += truncates(&apply(&mut machine,
                &json!({"type": "input_audio_buffer.speech_started"})));
            sent_truncates += truncates(&transition(&mut machine, Event::SpeechStarted).unwrap().effects);
        }
        prop_assert_eq!(sent_truncates, 1);

        let done = [
            json!({"type": "response.audio.done", "item_id": "i1", "content_index": 0}),
            json!({"type": "response.audio_transcript.done", "item_id": "i1", "content_index": 0, "transcript": "hi"}),
            json!({"type": "response.output_item.done", "response_id": "r1", "item": {
                "id": "i1", "type": "message", "role": "assistant", "status": "completed"}}),
        ];
        let ack = json!({"type": "conversation.item.truncated",
            "item_id": "i1", "content_index": 0, "audio_end_ms": chunks * 10});

        if done_before_ack {
            for event in &done {
                apply(&mut machine, event);
            }
            apply(&mut machine, &ack);
        } else {
            apply(&mut machine, &ack);
            for event in &done[..2] {
                // Deltas are closed after the ack; dones are still honored
                transition(&mut machine, server(event)).unwrap();
            }
            apply(&mut machine, &done[2]);
        }

        let part = machine.store().part("i1", 0).unwrap();
        prop_assert_eq!(part.state, PartState::Truncated);
        prop_assert_eq!(part.text.as_str(), "hi");
        prop_assert_eq!(part.audio.len(), chunks * 480);
        prop_assert_eq!(machine.store().item("i1").unwrap().status, ItemStatus::Truncated);
    }

    // Tool outputs land in completion order, once each
    #[test]
    fn prop_tool_outputs_follow_completion_order(
        order in Just(vec!["A", "B", "C"]).prop_shuffle(),
        duplicates in proptest::collection::vec(0usize..3, 0..4),
    ) {
        let mut machine = SessionMachine::new();
        apply(&mut machine, &json!({"type": "response.created", "response": {"id": "r1"}}));
        for call_id in ["A", "B", "C"] {
            apply(&mut machine, &json!({"type": "response.function_call_arguments.done",
                "item_id": format!("fc_{call_id}"), "call_id": call_id, "name": "f", "arguments": "{}"}));
        }
        apply(&mut machine, &json!({"type": "response.done", "response": {"id": "r1", "status": "completed"}}));

        let mut continuations = 0;
        for call_id in &order {
            let effects = transition(&mut machine, Event::ToolFinished {
                call_id: (*call_id).to_string(),
                outcome: Ok(json!({"call": call_id})),
            }).unwrap().effects;
            continuations += effects.iter()
                .filter(|e| matches!(e, Effect::Send(ClientEvent::ResponseCreate { .. })))
                .count();
        }
        for index in duplicates {
            let effects = transition(&mut machine, Event::ToolFinished {
                call_id: order[index].to_string(),
                outcome: Ok(json!("dup")),
            }).unwrap().effects;
            prop_assert!(effects.is_empty());
        }

        let outputs: Vec<_> = machine.store().items()
            .filter_map(|i| i.call_id.as_deref())
            .collect();
        prop_assert_eq!(outputs, order);
        prop_assert_eq!(continuations, 1);
    }

    // Any violation leaves the store exactly as it was
    #[test]
    fn prop_violations_never_mutate(events in proptest::collection::vec(arb_server_event(), 0..30)) {
        let mut machine = SessionMachine::new();
        for event in events {
            let before = machine.store().clone();
            if transition(&mut machine, server(&event)).is_err() {
                prop_assert_eq!(machine.store(), &before);
            }
            prop_assert!(machine.store().responses()
                .filter(|r| r.status == crate::protocol::ResponseStatus::InProgress)
                .count() <= 1);
        }
    }
}
