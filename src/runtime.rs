//! Runtime for driving a realtime session
//!
//! [`SessionRuntime`] owns the state machine and runs the routing loop;
//! [`SessionHandle`] feeds caller commands into the same queue.

mod executor;
mod lines;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;
pub use lines::{json_lines, JsonLinesTransport};
pub use traits::*;

use crate::error::SessionClosed;
use crate::protocol::SessionConfig;
use crate::state_machine::{Event, Notification};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Handle to interact with a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub(crate) event_tx: mpsc::Sender<Event>,
    pub(crate) broadcast_tx: broadcast::Sender<Notification>,
    pub(crate) shutdown: CancellationToken,
}

impl SessionHandle {
    async fn send(&self, event: Event) -> Result<(), SessionClosed> {
        if self.shutdown.is_cancelled() {
            return Err(SessionClosed);
        }
        self.event_tx.send(event).await.map_err(|_| SessionClosed)
    }

    /// Send `session.update` with new settings.
    pub async fn update_session(&self, session: SessionConfig) -> Result<(), SessionClosed> {
        self.send(Event::UpdateSession(session)).await
    }

    /// Add a user message and ask for a response.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(Event::UserText {
            prompts: vec![text.into()],
        })
        .await
    }

    /// Append raw input audio to the server's buffer.
    pub async fn append_audio(&self, audio: impl Into<Vec<u8>>) -> Result<(), SessionClosed> {
        self.send(Event::AppendAudio {
            audio: audio.into(),
        })
        .await
    }

    pub async fn commit_audio(&self) -> Result<(), SessionClosed> {
        self.send(Event::CommitAudio).await
    }

    pub async fn clear_audio(&self) -> Result<(), SessionClosed> {
        self.send(Event::ClearAudio).await
    }

    pub async fn create_response(&self) -> Result<(), SessionClosed> {
        self.send(Event::CreateResponse).await
    }

    /// Local voice activity began; interrupts assistant audio in flight.
    pub async fn speech_started(&self) -> Result<(), SessionClosed> {
        self.send(Event::SpeechStarted).await
    }

    /// Local voice activity ended; commits input when turn detection is off.
    pub async fn speech_stopped(&self) -> Result<(), SessionClosed> {
        self.send(Event::SpeechStopped).await
    }

    /// How much of an assistant audio part has actually been played.
    pub async fn report_playback(
        &self,
        item_id: impl Into<String>,
        content_index: u32,
        played_ms: u32,
    ) -> Result<(), SessionClosed> {
        self.send(Event::PlaybackProgress {
            item_id: item_id.into(),
            content_index,
            played_ms,
        })
        .await
    }

    /// Presentation notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.broadcast_tx.subscribe()
    }

    /// Stop the routing loop and cancel running tools.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.event_tx.is_closed()
    }
}
