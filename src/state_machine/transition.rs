//! Event router core
//!
//! Applies one event to the session machine and returns the effects the
//! runtime must execute, in order. All conversation state changes happen
//! here; the runtime only performs I/O.

use super::assembler::{Completion, DeltaAssembler, TextChannel};
use super::dispatcher::ToolCallDispatcher;
use super::effect::{Effect, Notification};
use super::interruption::InterruptionCoordinator;
use super::store::{ItemInsert, ItemStatus, PartState, SessionStore};
use super::Event;
use crate::error::{ProtocolViolation, SessionError};
use crate::protocol::{ClientEvent, ConversationItem, ItemType, ServerEvent, WireItemStatus};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Instant;

/// Result of a state transition
#[derive(Debug, Default)]
pub struct TransitionResult {
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    fn notify(self, notification: Notification) -> Self {
        self.with_effect(Effect::Notify(notification))
    }
}

/// The single writer over session state.
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    store: SessionStore,
    assembler: DeltaAssembler,
    interruption: InterruptionCoordinator,
    dispatcher: ToolCallDispatcher,
    /// When the user's turn last ended; cleared by the next finished response
    turn_ended: Option<Instant>,
    closed: bool,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn into_store(self) -> SessionStore {
        self.store
    }

    pub fn assembler(&self) -> &DeltaAssembler {
        &self.assembler
    }

    pub fn interruption(&self) -> &InterruptionCoordinator {
        &self.interruption
    }

    pub fn dispatcher(&self) -> &ToolCallDispatcher {
        &self.dispatcher
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop accepting tool results.
    pub fn close(&mut self) {
        self.closed = true;
        self.dispatcher.close();
    }
}

/// Apply one event.
///
/// A [`ProtocolViolation`] leaves the machine as it was before the event.
pub fn transition(
    machine: &mut SessionMachine,
    event: Event,
) -> Result<TransitionResult, ProtocolViolation> {
    match event {
        Event::Server(event) => apply_server_event(machine, event),

        // ============================================================
        // Local signals
        // ============================================================
        Event::SpeechStarted => Ok(speech_started(
            &mut machine.interruption,
            &mut machine.store,
        )),

        Event::SpeechStopped => {
            machine.interruption.on_speech_stopped();
            machine.turn_ended = Some(Instant::now());
            let result = TransitionResult::new().notify(Notification::SpeechStopped);
            if machine.store.server_commits_audio() {
                return Ok(result);
            }
            // Manual turn detection: the client ends the turn
            Ok(result
                .with_effect(Effect::Send(ClientEvent::InputAudioBufferCommit))
                .with_effects(machine.dispatcher.request_continuation(&machine.store)))
        }

        Event::PlaybackProgress {
            item_id,
            content_index,
            played_ms,
        } => {
            machine
                .interruption
                .report_playback(&item_id, content_index, played_ms);
            Ok(TransitionResult::new())
        }

        Event::ToolFinished { call_id, outcome } => {
            if machine.closed {
                tracing::debug!(call_id = %call_id, "Session closed, discarding tool result");
                return Ok(TransitionResult::new());
            }
            let effects = machine
                .dispatcher
                .on_tool_finished(&mut machine.store, &call_id, outcome);
            release_arguments(&machine.dispatcher, &mut machine.assembler, &call_id);
            Ok(TransitionResult::new().with_effects(effects))
        }

        // ============================================================
        // Caller commands
        // ============================================================
        Event::UpdateSession(session) => Ok(TransitionResult::new()
            .with_effect(Effect::Send(ClientEvent::SessionUpdate { session }))),

        Event::UserText { prompts } => {
            machine.turn_ended = Some(Instant::now());
            Ok(TransitionResult::new()
                .with_effect(Effect::Send(ClientEvent::create_item(
                    ConversationItem::user_text(prompts),
                )))
                .with_effects(machine.dispatcher.request_continuation(&machine.store)))
        }

        Event::AppendAudio { audio } => Ok(TransitionResult::new().with_effect(Effect::Send(
            ClientEvent::InputAudioBufferAppend {
                audio: BASE64.encode(audio),
            },
        ))),

        Event::CommitAudio => {
            machine.turn_ended = Some(Instant::now());
            Ok(TransitionResult::new()
                .with_effect(Effect::Send(ClientEvent::InputAudioBufferCommit)))
        }

        Event::ClearAudio => Ok(TransitionResult::new()
            .with_effect(Effect::Send(ClientEvent::InputAudioBufferClear))),

        Event::CreateResponse => Ok(TransitionResult::new()
            .with_effect(Effect::Send(ClientEvent::response_create()))),
    }
}

#[allow(clippy::too_many_lines)] // One arm per inbound event type
fn apply_server_event(
    machine: &mut SessionMachine,
    event: ServerEvent,
) -> Result<TransitionResult, ProtocolViolation> {
    let SessionMachine {
        store,
        assembler,
        interruption,
        dispatcher,
        turn_ended,
        ..
    } = machine;

    match event {
        ServerEvent::Error { error } => {
            interruption.on_server_error();
            Ok(TransitionResult::new().with_effect(Effect::error(SessionError::Server(error))))
        }

        // ============================================================
        // Session and conversation
        // ============================================================
        ServerEvent::SessionCreated { session } => {
            let session_id = session.id.clone();
            store.apply_session_created(session);
            Ok(TransitionResult::new().notify(Notification::SessionReady { session_id }))
        }

        ServerEvent::SessionUpdated { session } => {
            store.apply_session_updated(session);
            Ok(TransitionResult::new().notify(Notification::SessionUpdated))
        }

        ServerEvent::ConversationCreated { conversation } => {
            store.apply_conversation_created(conversation.id.clone());
            Ok(TransitionResult::new().notify(Notification::ConversationReady {
                conversation_id: conversation.id,
            }))
        }

        ServerEvent::ConversationItemCreated {
            previous_item_id,
            item,
        } => {
            let insert = store.apply_item_created(&item, previous_item_id.as_deref())?;
            Ok(TransitionResult::new().with_effects(item_inserted(store, &item, insert)))
        }

        ServerEvent::InputAudioTranscriptionCompleted {
            item_id,
            content_index,
            transcript,
        } => {
            let part = store.part_mut(&item_id, content_index)?;
            transcript.clone_into(&mut part.text);
            Ok(
                TransitionResult::new().notify(Notification::TranscriptionCompleted {
                    item_id,
                    content_index,
                    transcript,
                }),
            )
        }

        ServerEvent::ConversationItemTruncated {
            item_id,
            content_index,
            audio_end_ms,
        } => {
            let was_truncated = store
                .part(&item_id, content_index)
                .is_some_and(|p| p.state == PartState::Truncated);
            interruption.on_truncated(store, &item_id, content_index, audio_end_ms)?;

            let mut result = TransitionResult::new().notify(Notification::ItemStatusChanged {
                item_id: item_id.clone(),
                status: ItemStatus::Truncated,
            });
            if !was_truncated {
                let text = store
                    .part(&item_id, content_index)
                    .map(|p| p.text.clone())
                    .unwrap_or_default();
                result = result.notify(Notification::PartFinished {
                    item_id,
                    content_index,
                    state: PartState::Truncated,
                    text,
                });
            }
            Ok(result)
        }

        // ============================================================
        // Responses and output items
        // ============================================================
        ServerEvent::ResponseCreated { response } => {
            store.begin_response(&response.id)?;
            Ok(TransitionResult::new().notify(Notification::ResponseStarted {
                response_id: response.id,
            }))
        }

        ServerEvent::OutputItemAdded {
            response_id, item, ..
        } => {
            let insert = store.apply_item_created(&item, None)?;
            let mut effects = item_inserted(store, &item, insert);
            if let Some(item_id) = &item.id {
                store.attach_output(&response_id, item_id);
                if let Some(call_id) = &item.call_id {
                    dispatcher.on_arguments_started(item_id, call_id);
                }
            }
            effects.retain(|e| !matches!(e, Effect::Notify(Notification::ItemStatusChanged { .. })));
            Ok(TransitionResult::new().with_effects(effects))
        }

        ServerEvent::OutputItemDone {
            response_id, item, ..
        } => {
            let insert = store.apply_item_created(&item, None)?;
            let item_id = item.id.clone().unwrap_or_default();
            let mut result = TransitionResult::new();
            if matches!(insert, ItemInsert::Inserted { .. }) {
                result = result.with_effects(item_inserted(store, &item, insert));
            }
            result = result.with_effects(finalize_item_status(store, &item_id, item.status)?);
            store.attach_output(&response_id, &item_id);
            Ok(result.with_effects(function_call_done(store, assembler, dispatcher, &item)))
        }

        ServerEvent::ResponseDone { response } => {
            store.end_response(&response.id, response.status, response.usage.clone())?;

            let mut result = TransitionResult::new();
            for item in &response.output {
                let Some(item_id) = item.id.as_deref() else {
                    continue;
                };
                if store.item(item_id).is_none() {
                    let insert = store.apply_item_created(item, None)?;
                    result = result.with_effects(item_inserted(store, item, insert));
                }
                store.attach_output(&response.id, item_id);
                match finalize_item_status(store, item_id, item.status) {
                    Ok(effects) => result = result.with_effects(effects),
                    Err(violation) => result = result.with_effect(Effect::error(violation)),
                }
                result = result.with_effects(function_call_done(store, assembler, dispatcher, item));
            }

            // A truncate the server never acknowledged before finishing
            if let Some((item_id, content_index)) =
                interruption.on_response_done(store, &response.id)
            {
                let text = store
                    .part(&item_id, content_index)
                    .map(|p| p.text.clone())
                    .unwrap_or_default();
                result = result.notify(Notification::PartFinished {
                    item_id: item_id.clone(),
                    content_index,
                    state: PartState::Truncated,
                    text,
                });
                match finalize_item_status(store, &item_id, None) {
                    Ok(effects) => result = result.with_effects(effects),
                    Err(violation) => result = result.with_effect(Effect::error(violation)),
                }
            }

            // Argument streams never outlive their response
            for call_id in dispatcher.abandon_collecting() {
                assembler.forget(&call_id);
            }

            let latency = turn_ended.take().map(|ended| ended.elapsed());
            if let Some(latency) = latency {
                tracing::info!(
                    response_id = %response.id,
                    latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    "Response latency"
                );
            }

            Ok(result
                .notify(Notification::ResponseFinished {
                    response_id: response.id,
                    status: response.status,
                    usage: response.usage,
                    latency,
                })
                .with_effects(dispatcher.try_continue(store)))
        }

        // ============================================================
        // Content parts
        // ============================================================
        ServerEvent::ContentPartAdded {
            item_id,
            content_index,
            part,
            ..
        } => {
            assembler.on_part_added(store, &item_id, content_index, &part)?;
            Ok(TransitionResult::new().notify(Notification::PartStarted {
                item_id,
                content_index,
            }))
        }

        ServerEvent::ContentPartDone {
            item_id,
            content_index,
            part,
            ..
        } => {
            let completion = assembler.on_part_done(store, &item_id, content_index, &part)?;
            Ok(TransitionResult::new().with_effects(part_finished(completion)))
        }

        ServerEvent::TextDelta {
            item_id,
            content_index,
            delta,
        } => {
            assembler.on_text_delta(store, &item_id, content_index, TextChannel::Text, &delta)?;
            Ok(TransitionResult::new().notify(Notification::TextDelta {
                item_id,
                content_index,
                delta,
            }))
        }

        ServerEvent::TextDone {
            item_id,
            content_index,
            text,
        } => {
            let completion = assembler.on_text_done(store, &item_id, content_index, &text)?;
            Ok(TransitionResult::new().with_effects(part_finished(completion)))
        }

        ServerEvent::AudioDelta {
            item_id,
            content_index,
            delta,
        } => {
            let audio = assembler.on_audio_delta(store, &item_id, content_index, &delta)?;
            Ok(TransitionResult::new().notify(Notification::AudioDelta {
                item_id,
                content_index,
                audio,
            }))
        }

        ServerEvent::AudioDone {
            item_id,
            content_index,
        } => {
            let completion = assembler.on_audio_done(store, &item_id, content_index)?;
            Ok(TransitionResult::new().with_effects(part_finished(completion)))
        }

        ServerEvent::AudioTranscriptDelta {
            item_id,
            content_index,
            delta,
        } => {
            assembler.on_text_delta(
                store,
                &item_id,
                content_index,
                TextChannel::Transcript,
                &delta,
            )?;
            Ok(TransitionResult::new().notify(Notification::TranscriptDelta {
                item_id,
                content_index,
                delta,
            }))
        }

        ServerEvent::AudioTranscriptDone {
            item_id,
            content_index,
            transcript,
        } => {
            let completion =
                assembler.on_text_done(store, &item_id, content_index, &transcript)?;
            Ok(TransitionResult::new().with_effects(part_finished(completion)))
        }

        // ============================================================
        // Function call arguments
        // ============================================================
        ServerEvent::FunctionCallArgumentsDelta {
            item_id,
            call_id,
            delta,
        } => {
            if dispatcher.is_settled(&call_id) {
                return Err(ProtocolViolation::ArgumentsAfterDone(call_id));
            }
            assembler.on_arguments_delta(&item_id, &call_id, &delta)?;
            dispatcher.on_arguments_started(&item_id, &call_id);
            Ok(TransitionResult::new())
        }

        ServerEvent::FunctionCallArgumentsDone {
            item_id,
            call_id,
            arguments,
            name,
        } => {
            let mut result = TransitionResult::new();
            if dispatcher.is_settled(&call_id) {
                tracing::debug!(call_id = %call_id, "Arguments for settled call ignored");
                return Ok(result);
            }
            if let Some(Completion::Arguments(done)) = assembler.on_arguments_done(
                store,
                &item_id,
                &call_id,
                &arguments,
                name.as_deref(),
            ) {
                result = result.with_effects(dispatcher.on_arguments_complete(store, done));
            }
            release_arguments(dispatcher, assembler, &call_id);
            Ok(result)
        }

        // ============================================================
        // Rate limits and input audio
        // ============================================================
        ServerEvent::RateLimitsUpdated { rate_limits } => {
            store.apply_rate_limits(&rate_limits);
            Ok(TransitionResult::new().notify(Notification::RateLimitsUpdated))
        }

        ServerEvent::InputAudioBufferCommitted { item_id, .. } => Ok(
            TransitionResult::new().notify(Notification::InputAudioCommitted { item_id })
        ),

        ServerEvent::InputAudioBufferCleared => {
            Ok(TransitionResult::new().notify(Notification::InputAudioCleared))
        }

        ServerEvent::SpeechStarted { .. } => Ok(speech_started(interruption, store)),

        ServerEvent::SpeechStopped { .. } => {
            interruption.on_speech_stopped();
            *turn_ended = Some(Instant::now());
            Ok(TransitionResult::new().notify(Notification::SpeechStopped))
        }

        ServerEvent::Unrecognized { raw_type, .. } => {
            Ok(TransitionResult::new().notify(Notification::Unrecognized {
                event_type: raw_type,
            }))
        }
    }
}

/// Dispatch a finished function call item whose arguments never streamed
/// separately. Calls already dispatched or settled are left alone.
fn function_call_done(
    store: &mut SessionStore,
    assembler: &mut DeltaAssembler,
    dispatcher: &mut ToolCallDispatcher,
    item: &ConversationItem,
) -> Vec<Effect> {
    let (ItemType::FunctionCall, Some(item_id), Some(call_id), Some(arguments)) =
        (item.item_type, &item.id, &item.call_id, &item.arguments)
    else {
        return vec![];
    };
    if dispatcher.is_settled(call_id) {
        return vec![];
    }
    let mut effects = vec![];
    if let Some(Completion::Arguments(done)) =
        assembler.on_arguments_done(store, item_id, call_id, arguments, item.name.as_deref())
    {
        effects = dispatcher.on_arguments_complete(store, done);
    }
    release_arguments(dispatcher, assembler, call_id);
    effects
}

/// Drop the argument buffer of a call that can no longer change.
fn release_arguments(
    dispatcher: &ToolCallDispatcher,
    assembler: &mut DeltaAssembler,
    call_id: &str,
) {
    if dispatcher.is_settled(call_id) {
        assembler.forget(call_id);
    }
}

fn speech_started(
    interruption: &mut InterruptionCoordinator,
    store: &mut SessionStore,
) -> TransitionResult {
    let result = TransitionResult::new().notify(Notification::SpeechStarted);
    let Some(request) = interruption.on_speech_started(store) else {
        return result;
    };
    result
        .with_effect(Effect::Send(ClientEvent::ConversationItemTruncate {
            item_id: request.item_id.clone(),
            content_index: request.content_index,
            audio_end_ms: request.audio_end_ms,
        }))
        .notify(Notification::PlaybackInterrupted {
            item_id: request.item_id,
            content_index: request.content_index,
            audio_end_ms: request.audio_end_ms,
        })
}

fn item_inserted(store: &SessionStore, item: &ConversationItem, insert: ItemInsert) -> Vec<Effect> {
    let Some(item_id) = item.id.clone() else {
        return vec![];
    };
    match insert {
        ItemInsert::Inserted { out_of_order } => {
            if out_of_order {
                tracing::warn!(item_id = %item_id, "Item inserted after unknown predecessor");
            }
            vec![Effect::Notify(Notification::ItemAdded {
                item_id,
                item_type: item.item_type,
                out_of_order,
            })]
        }
        ItemInsert::AlreadyPresent => store
            .item(&item_id)
            .map(|stored| {
                Effect::Notify(Notification::ItemStatusChanged {
                    item_id,
                    status: stored.status,
                })
            })
            .into_iter()
            .collect(),
    }
}

/// Apply the server's final item status.
///
/// An item with any truncated part stays truncated, whatever the server says.
fn finalize_item_status(
    store: &mut SessionStore,
    item_id: &str,
    status: Option<WireItemStatus>,
) -> Result<Vec<Effect>, ProtocolViolation> {
    let Some(item) = store.item(item_id) else {
        return Ok(vec![]);
    };
    let interrupted = item.parts.iter().any(|p| p.truncation.is_some());
    let target = match status {
        _ if interrupted || item.status == ItemStatus::Truncated => ItemStatus::Truncated,
        Some(WireItemStatus::Completed) => ItemStatus::Completed,
        Some(WireItemStatus::Incomplete) => ItemStatus::Truncated,
        Some(WireItemStatus::InProgress) | None => return Ok(vec![]),
    };
    if item.status == target {
        return Ok(vec![]);
    }
    store.apply_item_status_change(item_id, target)?;
    Ok(vec![Effect::Notify(Notification::ItemStatusChanged {
        item_id: item_id.to_string(),
        status: target,
    })])
}

fn part_finished(completion: Option<Completion>) -> Option<Effect> {
    match completion? {
        Completion::Part {
            item_id,
            content_index,
            state,
            text,
        } => Some(Effect::Notify(Notification::PartFinished {
            item_id,
            content_index,
            state,
            text,
        })),
        Completion::Arguments(_) => None,
    }
}
