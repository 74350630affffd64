//! JSON-lines transport
//!
//! One event per line. Lets the binary sit behind any websocket bridge, or
//! replay a recorded session file on stdin.

use super::traits::Transport;
use crate::error::TransportError;
use crate::protocol::ClientEvent;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::wrappers::SplitStream;

/// Writes each outbound event as a single JSON line.
pub struct JsonLinesTransport<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Transport for JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| TransportError::new(format!("failed to encode {}: {e}", event.event_type())))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Inbound payloads from a line-oriented reader; blank lines are skipped.
///
/// Lines are passed on as raw bytes. A line that is not valid UTF-8 is the
/// decoder's problem, not a transport failure.
pub fn json_lines<R>(reader: R) -> impl Stream<Item = Result<Vec<u8>, TransportError>>
where
    R: AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    SplitStream::new(reader.split(b'\n')).filter_map(|line| async move {
        match line {
            Ok(mut line) => {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    None
                } else {
                    Some(Ok(line))
                }
            }
            Err(e) => Some(Err(TransportError::from(e))),
        }
    })
}
