//! Interruption coordinator
//!
//! When the user starts talking over streaming assistant audio, the part is
//! cut at the point playback reached and a truncate request goes upstream.
//! The part ends `Truncated` whether its `done` lands before or after the
//! server's acknowledgement.

use super::store::{ItemStatus, PartKind, PartState, SessionStore, Truncation};
use crate::error::ProtocolViolation;
use crate::protocol::{AudioFormat, Role};
use std::collections::HashMap;

/// PCM16 mono at 24 kHz.
const PCM16_BYTES_PER_MS: usize = 48;
/// G.711 at 8 kHz, one byte per sample.
const G711_BYTES_PER_MS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InterruptionState {
    #[default]
    Idle,
    UserSpeaking,
    AwaitingTruncationAck {
        item_id: String,
        content_index: u32,
        audio_end_ms: u32,
    },
}

/// A truncate request to send upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateRequest {
    pub item_id: String,
    pub content_index: u32,
    pub audio_end_ms: u32,
}

#[derive(Debug, Clone, Default)]
pub struct InterruptionCoordinator {
    state: InterruptionState,
    /// Playback offsets reported by the caller, per (item, content index)
    playback: HashMap<(String, u32), u32>,
}

impl InterruptionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &InterruptionState {
        &self.state
    }

    /// Record how far the caller has played a part.
    pub fn report_playback(&mut self, item_id: &str, content_index: u32, played_ms: u32) {
        self.playback
            .insert((item_id.to_string(), content_index), played_ms);
    }

    /// Speech started, from local VAD or the server.
    ///
    /// Only the first signal of an utterance can interrupt; repeats while the
    /// user is speaking or a truncate is in flight do nothing.
    pub fn on_speech_started(&mut self, store: &mut SessionStore) -> Option<TruncateRequest> {
        if self.state != InterruptionState::Idle {
            return None;
        }

        let Some((item_id, content_index, received)) = streaming_audio(store) else {
            self.state = InterruptionState::UserSpeaking;
            return None;
        };

        let bytes_per_ms = bytes_per_ms(store.output_audio_format());
        let received_ms = u32::try_from(received / bytes_per_ms).unwrap_or(u32::MAX);
        let audio_end_ms = self
            .playback
            .get(&(item_id.clone(), content_index))
            .map_or(received_ms, |played| (*played).min(received_ms));

        if let Ok(part) = store.part_mut(&item_id, content_index) {
            part.truncation = Some(Truncation {
                audio_end_ms,
                acknowledged: false,
            });
        }

        tracing::info!(item_id = %item_id, content_index, audio_end_ms, "Interrupting assistant audio");
        self.state = InterruptionState::AwaitingTruncationAck {
            item_id: item_id.clone(),
            content_index,
            audio_end_ms,
        };
        Some(TruncateRequest {
            item_id,
            content_index,
            audio_end_ms,
        })
    }

    /// Speech stopped. Returns to `Idle` unless a truncate is in flight.
    pub fn on_speech_stopped(&mut self) {
        if self.state == InterruptionState::UserSpeaking {
            self.state = InterruptionState::Idle;
        }
    }

    /// Server confirmed a truncation.
    ///
    /// The part becomes `Truncated`, its audio is cut to `audio_end_ms`, and
    /// its item is marked truncated. Returns whether this was the ack the
    /// coordinator was waiting for.
    pub fn on_truncated(
        &mut self,
        store: &mut SessionStore,
        item_id: &str,
        content_index: u32,
        audio_end_ms: u32,
    ) -> Result<bool, ProtocolViolation> {
        let bytes_per_ms = bytes_per_ms(store.output_audio_format());
        let part = store.part_mut(item_id, content_index)?;
        part.truncation = Some(Truncation {
            audio_end_ms,
            acknowledged: true,
        });
        part.state = PartState::Truncated;
        part.text_open = false;
        part.audio_open = false;
        let keep = usize::try_from(audio_end_ms)
            .unwrap_or(usize::MAX)
            .saturating_mul(bytes_per_ms);
        part.audio.truncate(keep);

        store.apply_item_status_change(item_id, ItemStatus::Truncated)?;
        self.playback.remove(&(item_id.to_string(), content_index));

        let matched = matches!(
            &self.state,
            InterruptionState::AwaitingTruncationAck { item_id: pending, content_index: idx, .. }
                if pending == item_id && *idx == content_index
        );
        if matched {
            self.state = InterruptionState::Idle;
        }
        Ok(matched)
    }

    /// A response finished. If it owns the part whose truncation is still
    /// unacknowledged, no ack is coming: the part settles `Truncated` and
    /// the coordinator returns to `Idle`.
    ///
    /// Returns the part that was settled here, if any.
    pub fn on_response_done(
        &mut self,
        store: &mut SessionStore,
        response_id: &str,
    ) -> Option<(String, u32)> {
        let InterruptionState::AwaitingTruncationAck {
            item_id,
            content_index,
            ..
        } = &self.state
        else {
            return None;
        };
        let owned = store
            .response(response_id)
            .is_some_and(|r| r.output.iter().any(|id| id == item_id));
        if !owned {
            return None;
        }
        let (item_id, content_index) = (item_id.clone(), *content_index);
        tracing::warn!(item_id = %item_id, content_index, "Response finished without truncation ack");
        self.state = InterruptionState::Idle;
        self.playback.remove(&(item_id.clone(), content_index));

        let part = store.part_mut(&item_id, content_index).ok()?;
        part.text_open = false;
        part.audio_open = false;
        if part.state == PartState::Truncated {
            return None;
        }
        part.state = PartState::Truncated;
        Some((item_id, content_index))
    }

    /// The server rejected a request. A pending truncate may have been the
    /// one rejected, so stop waiting for its ack.
    pub fn on_server_error(&mut self) {
        if let InterruptionState::AwaitingTruncationAck { item_id, .. } = &self.state {
            tracing::warn!(item_id = %item_id, "Server error while awaiting truncation ack");
            self.state = InterruptionState::Idle;
        }
    }
}

/// The assistant audio part streaming in the active response, with the
/// number of bytes received so far.
fn streaming_audio(store: &SessionStore) -> Option<(String, u32, usize)> {
    let response = store.active_response()?;
    response
        .output
        .iter()
        .filter_map(|id| store.item(id))
        .filter(|item| item.role == Some(Role::Assistant))
        .find_map(|item| {
            item.parts
                .iter()
                .find(|p| {
                    p.kind == PartKind::Audio
                        && p.state == PartState::Streaming
                        && p.truncation.is_none()
                })
                .map(|p| (item.id.clone(), p.index, p.audio.len()))
        })
}

fn bytes_per_ms(format: Option<AudioFormat>) -> usize {
    match format {
        Some(AudioFormat::G711Ulaw | AudioFormat::G711Alaw) => G711_BYTES_PER_MS,
        Some(AudioFormat::Pcm16) | None => PCM16_BYTES_PER_MS,
    }
}
