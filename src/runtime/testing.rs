//! Mock implementations for testing
//!
//! These mocks drive the real runtime end to end without a network.

use super::traits::Transport;
use super::{SessionHandle, SessionRuntime};
use crate::config::RealtimeConfig;
use crate::error::{SessionError, ToolExecutionError, TransportError};
use crate::protocol::ClientEvent;
use crate::state_machine::{Notification, SessionStore};
use crate::tools::{no_parameters, Tool, ToolContext, ToolRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Mock Transport
// ============================================================================

/// Records outbound events; can be told to fail like a dropped connection.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<ClientEvent>>,
    fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every send fails.
    pub fn failing() -> Self {
        let transport = Self::new();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_types(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(ClientEvent::event_type)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::new("connection closed"));
        }
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Gated Tool
// ============================================================================

/// A tool whose calls block until the test releases them, so completion
/// order is under test control.
pub struct GatedTool {
    name: String,
    senders: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    receivers: Mutex<HashMap<String, oneshot::Receiver<Value>>>,
    /// Arguments of every call, in invocation order
    pub calls: Mutex<Vec<(String, Value)>>,
    /// Context handed to each call
    pub contexts: Mutex<Vec<ToolContext>>,
}

impl GatedTool {
    pub fn new(name: impl Into<String>, call_ids: &[&str]) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for call_id in call_ids {
            let (tx, rx) = oneshot::channel();
            senders.insert((*call_id).to_string(), tx);
            receivers.insert((*call_id).to_string(), rx);
        }
        Self {
            name: name.into(),
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
            calls: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Let `call_id` finish with `output`.
    pub fn release(&self, call_id: &str, output: Value) {
        let sender = self.senders.lock().unwrap().remove(call_id);
        if let Some(sender) = sender {
            let _ = sender.send(output);
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Gated test tool {}", self.name)
    }

    fn parameters(&self) -> Value {
        no_parameters()
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> Result<Value, ToolExecutionError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.call_id.clone(), input));
        self.contexts.lock().unwrap().push(ctx.clone());
        let gate = self.receivers.lock().unwrap().remove(&ctx.call_id);
        let Some(gate) = gate else {
            return Err(ToolExecutionError::new(format!("no gate for {}", ctx.call_id)));
        };
        gate.await
            .map_err(|_| ToolExecutionError::new("gate dropped"))
    }
}

// ============================================================================
// Test Session
// ============================================================================

/// Encode a JSON event as an inbound payload.
pub fn frame(event: &Value) -> Vec<u8> {
    event.to_string().into_bytes()
}

/// A running runtime wired to a [`MockTransport`] and a channel-backed
/// inbound stream.
pub struct TestSession {
    pub transport: Arc<MockTransport>,
    pub handle: SessionHandle,
    pub notifications: broadcast::Receiver<Notification>,
    inbound: mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
    runtime: JoinHandle<Result<SessionStore, SessionError>>,
}

impl TestSession {
    pub fn start(config: RealtimeConfig, tools: ToolRegistry) -> Self {
        Self::start_with(config, tools, Arc::new(MockTransport::new()))
    }

    pub fn start_with(
        config: RealtimeConfig,
        tools: ToolRegistry,
        transport: Arc<MockTransport>,
    ) -> Self {
        let (runtime, handle) = SessionRuntime::new(config, Arc::clone(&transport), tools);
        // Subscribe before spawning so bootstrap notifications are seen
        let notifications = handle.subscribe();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let runtime = tokio::spawn(runtime.run(UnboundedReceiverStream::new(inbound_rx)));

        Self {
            transport,
            handle,
            notifications,
            inbound,
            runtime,
        }
    }

    /// Feed one server event.
    pub fn push(&self, event: &Value) {
        self.push_raw(&frame(event));
    }

    pub fn push_raw(&self, raw: &[u8]) {
        let _ = self.inbound.send(Ok(raw.to_vec()));
    }

    /// Simulate the connection dropping mid-stream.
    pub fn push_transport_error(&self, message: &str) {
        let _ = self.inbound.send(Err(TransportError::new(message)));
    }

    /// Wait for the first notification matching `pred`.
    pub async fn wait_for(
        &mut self,
        pred: impl Fn(&Notification) -> bool,
    ) -> Option<Notification> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.notifications.recv()).await {
                Ok(Ok(notification)) if pred(&notification) => return Some(notification),
                Ok(Ok(_) | Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    /// Wait until the outbound log satisfies `pred`.
    pub async fn wait_for_sent(&self, pred: impl Fn(&[ClientEvent]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if pred(&self.transport.sent()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// End the inbound stream and collect the runtime's result.
    pub async fn end_inbound(self) -> Result<SessionStore, SessionError> {
        drop(self.inbound);
        self.runtime.await.expect("runtime panicked")
    }

    /// Close through the handle and collect the runtime's result.
    pub async fn finish(self) -> Result<SessionStore, SessionError> {
        self.handle.close();
        self.runtime.await.expect("runtime panicked")
    }
}

/// Function call outputs sent upstream, in send order.
pub fn sent_outputs(sent: &[ClientEvent]) -> Vec<(String, String)> {
    sent.iter()
        .filter_map(|event| match event {
            ClientEvent::ConversationItemCreate { item, .. } => {
                Some((item.call_id.clone()?, item.output.clone()?))
            }
            _ => None,
        })
        .collect()
}

fn count_type(sent: &[ClientEvent], event_type: &str) -> usize {
    sent.iter().filter(|e| e.event_type() == event_type).count()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionClosed;
    use crate::state_machine::{ItemStatus, PartState};
    use crate::tools::FnTool;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;

    fn call_events(response_id: &str, calls: &[(&str, &str, &str)]) -> Vec<Value> {
        let mut events = vec![json!({"type": "response.created", "response": {"id": response_id}})];
        for (call_id, name, arguments) in calls {
            let item_id = format!("fc_{call_id}");
            events.push(json!({"type": "response.output_item.added", "response_id": response_id,
                "item": {"id": item_id, "type": "function_call", "call_id": call_id, "name": name,
                         "status": "in_progress"}}));
            events.push(json!({"type": "response.function_call_arguments.delta",
                "item_id": item_id, "call_id": call_id, "delta": arguments}));
            events.push(json!({"type": "response.function_call_arguments.done",
                "item_id": item_id, "call_id": call_id, "arguments": arguments}));
            events.push(json!({"type": "response.output_item.done", "response_id": response_id,
                "item": {"id": item_id, "type": "function_call", "call_id": call_id, "name": name,
                         "arguments": arguments, "status": "completed"}}));
        }
        events.push(json!({"type": "response.done", "response": {"id": response_id, "status": "completed"}}));
        events
    }

    #[tokio::test]
    async fn test_bootstrap_sends_session_update_and_prompts() {
        let config = RealtimeConfig {
            initial_prompts: vec!["Hello".to_string(), "What time is it?".to_string()],
            ..RealtimeConfig::default()
        };
        let session = TestSession::start(config, ToolRegistry::standard());

        assert!(session.wait_for_sent(|sent| sent.len() >= 3).await);
        let sent = session.transport.sent();
        assert_eq!(
            session.transport.sent_types(),
            vec!["session.update", "conversation.item.create", "response.create"]
        );

        let ClientEvent::SessionUpdate { session: config } = &sent[0] else {
            panic!("expected session.update, got {:?}", sent[0]);
        };
        let tools: Vec<_> = config.tools.iter().flatten().map(|t| t.name.as_str()).collect();
        assert_eq!(tools, vec!["get_current_time", "get_random_number"]);

        let ClientEvent::ConversationItemCreate { item, .. } = &sent[1] else {
            panic!("expected conversation.item.create, got {:?}", sent[1]);
        };
        let texts: Vec<_> = item.content.iter().filter_map(|p| p.text()).collect();
        assert_eq!(texts, vec!["Hello", "What time is it?"]);

        session.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_text_response_end_to_end() {
        let mut session = TestSession::start(RealtimeConfig::default(), ToolRegistry::new());
        for event in [
            json!({"type": "session.created", "session": {"id": "sess_1"}}),
            json!({"type": "response.created", "response": {"id": "r1"}}),
            json!({"type": "response.output_item.added", "response_id": "r1", "item": {
                "id": "i1", "type": "message", "role": "assistant", "status": "in_progress"}}),
            json!({"type": "response.content_part.added", "item_id": "i1", "content_index": 0,
                   "part": {"type": "text", "text": ""}}),
            json!({"type": "response.text.delta", "item_id": "i1", "content_index": 0, "delta": "Hel"}),
            json!({"type": "response.text.delta", "item_id": "i1", "content_index": 0, "delta": "lo"}),
            json!({"type": "response.text.done", "item_id": "i1", "content_index": 0, "text": "Hello"}),
            json!({"type": "response.content_part.done", "item_id": "i1", "content_index": 0,
                   "part": {"type": "text", "text": "Hello"}}),
            json!({"type": "response.output_item.done", "response_id": "r1", "item": {
                "id": "i1", "type": "message", "role": "assistant", "status": "completed"}}),
            json!({"type": "response.done", "response": {"id": "r1", "status": "completed"}}),
        ] {
            session.push(&event);
        }

        let finished = session
            .wait_for(|n| matches!(n, Notification::ResponseFinished { .. }))
            .await;
        assert!(finished.is_some());

        let store = session.finish().await.unwrap();
        let item = store.item("i1").unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.parts[0].text, "Hello");
        assert_eq!(item.parts[0].state, PartState::Done);
        assert!(store.active_response().is_none());
    }

    #[tokio::test]
    async fn test_weather_call_dispatched_once() {
        let weather = FnTool::sync("get_weather", "Weather", no_parameters(), |input: Value| {
            assert_eq!(input, json!({"city": "NYC"}));
            Ok(json!({"temp_f": 72}))
        });
        let session = TestSession::start(
            RealtimeConfig::default(),
            ToolRegistry::new().with_tool(weather),
        );
        for event in call_events("r1", &[("c1", "get_weather", r#"{"city":"NYC"}"#)]) {
            session.push(&event);
        }

        assert!(
            session
                .wait_for_sent(|sent| count_type(sent, "response.create") == 1)
                .await
        );
        let sent = session.transport.sent();
        assert_eq!(
            sent_outputs(&sent),
            vec![("c1".to_string(), r#"{"temp_f":72}"#.to_string())]
        );
        // The output precedes the continuation
        assert_eq!(
            session.transport.sent_types(),
            vec!["session.update", "conversation.item.create", "response.create"]
        );

        let store = session.finish().await.unwrap();
        assert_eq!(store.function_call("c1").unwrap().output, None);
        assert_eq!(
            store.items().filter(|i| i.call_id.as_deref() == Some("c1")).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_outputs_follow_completion_order() {
        let tool = Arc::new(GatedTool::new("lookup", &["A", "B"]));
        let session = TestSession::start(
            RealtimeConfig::default(),
            ToolRegistry::new().with_tool(Arc::clone(&tool)),
        );
        for event in call_events("r1", &[("A", "lookup", "{}"), ("B", "lookup", "{}")]) {
            session.push(&event);
        }

        let deadline = tokio::time::Instant::now() + WAIT;
        while tool.call_count() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tool.call_count(), 2);

        tool.release("B", json!("b"));
        assert!(session.wait_for_sent(|sent| sent_outputs(sent).len() == 1).await);
        // A is still open, so no continuation yet
        assert_eq!(count_type(&session.transport.sent(), "response.create"), 0);

        tool.release("A", json!("a"));
        assert!(
            session
                .wait_for_sent(|sent| count_type(sent, "response.create") == 1)
                .await
        );
        let outputs: Vec<_> = sent_outputs(&session.transport.sent())
            .into_iter()
            .map(|(call_id, _)| call_id)
            .collect();
        assert_eq!(outputs, vec!["B", "A"]);

        session.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_running_tools() {
        let tool = Arc::new(GatedTool::new("lookup", &["c1"]));
        let session = TestSession::start(
            RealtimeConfig::default(),
            ToolRegistry::new().with_tool(Arc::clone(&tool)),
        );
        let transport = Arc::clone(&session.transport);
        for event in call_events("r1", &[("c1", "lookup", "{}")]) {
            session.push(&event);
        }

        let deadline = tokio::time::Instant::now() + WAIT;
        while tool.call_count() < 1 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tool.call_count(), 1);
        let ctx = tool.contexts.lock().unwrap()[0].clone();
        assert!(!ctx.cancel.is_cancelled());

        let store = session.finish().await.unwrap();
        assert!(ctx.cancel.is_cancelled());

        // A handler that ignores cancellation still has nowhere to report
        tool.release("c1", json!("late"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = transport.sent();
        assert!(sent_outputs(&sent).is_empty());
        assert_eq!(count_type(&sent, "response.create"), 0);
        assert_eq!(
            store.items().filter(|i| i.call_id.as_deref() == Some("c1")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancelled_call_stream_does_not_block_next_turn() {
        let mut session = TestSession::start(RealtimeConfig::default(), ToolRegistry::standard());
        for event in [
            json!({"type": "response.created", "response": {"id": "r1"}}),
            json!({"type": "response.output_item.added", "response_id": "r1", "item": {
                "id": "fc_c1", "type": "function_call", "call_id": "c1", "name": "get_current_time"}}),
            json!({"type": "response.function_call_arguments.delta",
                "item_id": "fc_c1", "call_id": "c1", "delta": "{"}),
            json!({"type": "response.done", "response": {"id": "r1", "status": "cancelled"}}),
        ] {
            session.push(&event);
        }
        assert!(session
            .wait_for(|n| matches!(n, Notification::ResponseFinished { .. }))
            .await
            .is_some());

        session.handle.send_text("Still there?").await.unwrap();
        assert!(
            session
                .wait_for_sent(|sent| count_type(sent, "response.create") == 1)
                .await
        );
        assert!(sent_outputs(&session.transport.sent()).is_empty());

        session.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tool_produces_error_output() {
        let mut session = TestSession::start(RealtimeConfig::default(), ToolRegistry::new());
        for event in call_events("r1", &[("c1", "get_weather", "{}")]) {
            session.push(&event);
        }

        let error = session
            .wait_for(|n| matches!(n, Notification::Error(SessionError::Tool(_))))
            .await;
        assert!(error.is_some());
        assert!(
            session
                .wait_for_sent(|sent| count_type(sent, "response.create") == 1)
                .await
        );
        let outputs = sent_outputs(&session.transport.sent());
        assert_eq!(outputs.len(), 1);
        let output: Value = serde_json::from_str(&outputs[0].1).unwrap();
        assert!(output["error"].as_str().unwrap().contains("get_weather"));

        session.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_and_undecodable_events_do_not_stop_routing() {
        let mut session = TestSession::start(RealtimeConfig::default(), ToolRegistry::new());
        session.push(&json!({"type": "foo.bar", "x": 1}));
        session.push_raw(b"not json");
        session.push(&json!({"type": "session.created", "session": {"id": "sess_1"}}));

        let unrecognized = session
            .wait_for(|n| matches!(n, Notification::Unrecognized { .. }))
            .await;
        assert!(matches!(
            unrecognized,
            Some(Notification::Unrecognized { event_type }) if event_type == "foo.bar"
        ));
        let decode = session
            .wait_for(|n| matches!(n, Notification::Error(SessionError::Decode(_))))
            .await;
        assert!(decode.is_some());
        let ready = session
            .wait_for(|n| matches!(n, Notification::SessionReady { .. }))
            .await;
        assert!(ready.is_some());

        let store = session.end_inbound().await.unwrap();
        assert_eq!(store.session().unwrap().id, "sess_1");
    }

    #[tokio::test]
    async fn test_interruption_truncates_at_reported_playback() {
        let mut session = TestSession::start(RealtimeConfig::default(), ToolRegistry::new());
        for event in [
            json!({"type": "response.created", "response": {"id": "r1"}}),
            json!({"type": "response.output_item.added", "response_id": "r1", "item": {
                "id": "i1", "type": "message", "role": "assistant"}}),
            json!({"type": "response.content_part.added", "item_id": "i1", "content_index": 0,
                   "part": {"type": "audio"}}),
            // 100ms of pcm16 at 24kHz
            json!({"type": "response.audio.delta", "item_id": "i1", "content_index": 0,
                   "delta": BASE64.encode(vec![0u8; 4800])}),
        ] {
            session.push(&event);
        }
        assert!(session
            .wait_for(|n| matches!(n, Notification::AudioDelta { .. }))
            .await
            .is_some());

        session.handle.report_playback("i1", 0, 40).await.unwrap();
        session.handle.speech_started().await.unwrap();

        let interrupted = session
            .wait_for(|n| matches!(n, Notification::PlaybackInterrupted { .. }))
            .await;
        assert!(matches!(
            interrupted,
            Some(Notification::PlaybackInterrupted { audio_end_ms: 40, .. })
        ));
        let truncate = session.transport.sent().into_iter().find_map(|e| match e {
            ClientEvent::ConversationItemTruncate {
                item_id,
                audio_end_ms,
                ..
            } => Some((item_id, audio_end_ms)),
            _ => None,
        });
        assert_eq!(truncate, Some(("i1".to_string(), 40)));

        session.push(&json!({"type": "conversation.item.truncated",
            "item_id": "i1", "content_index": 0, "audio_end_ms": 40}));
        assert!(session
            .wait_for(|n| matches!(n, Notification::PartFinished { state: PartState::Truncated, .. }))
            .await
            .is_some());

        let store = session.finish().await.unwrap();
        let part = store.part("i1", 0).unwrap();
        assert_eq!(part.state, PartState::Truncated);
        assert_eq!(part.audio.len(), 40 * 48);
    }

    #[tokio::test]
    async fn test_handle_commands_reach_the_wire() {
        let session = TestSession::start(RealtimeConfig::default(), ToolRegistry::new());
        session.handle.append_audio(vec![1u8, 2, 3]).await.unwrap();
        session.handle.commit_audio().await.unwrap();
        session.handle.clear_audio().await.unwrap();
        session.handle.send_text("Hi").await.unwrap();

        assert!(session.wait_for_sent(|sent| sent.len() >= 6).await);
        assert_eq!(
            session.transport.sent_types(),
            vec![
                "session.update",
                "input_audio_buffer.append",
                "input_audio_buffer.commit",
                "input_audio_buffer.clear",
                "conversation.item.create",
                "response.create",
            ]
        );
        let sent = session.transport.sent();
        assert_eq!(
            sent[1],
            ClientEvent::InputAudioBufferAppend {
                audio: BASE64.encode([1u8, 2, 3])
            }
        );

        let handle = session.handle.clone();
        session.finish().await.unwrap();
        assert!(handle.is_closed());
        assert_eq!(handle.commit_audio().await, Err(SessionClosed));
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal() {
        let session = TestSession::start_with(
            RealtimeConfig::default(),
            ToolRegistry::new(),
            Arc::new(MockTransport::failing()),
        );
        let result = session.end_inbound().await;
        assert!(matches!(result, Err(e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_inbound_stream_error_is_fatal() {
        let mut session = TestSession::start(RealtimeConfig::default(), ToolRegistry::new());
        session.push(&json!({"type": "session.created", "session": {"id": "sess_1"}}));
        session.push_transport_error("reset by peer");

        let error = session
            .wait_for(|n| matches!(n, Notification::Error(SessionError::Transport(_))))
            .await;
        assert!(error.is_some());
        assert!(matches!(
            session.end_inbound().await,
            Err(SessionError::Transport(e)) if e.message == "reset by peer"
        ));
    }
}
