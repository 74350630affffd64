//! Realtime session client over stdio
//!
//! Reads server events as JSON lines on stdin and writes client events as
//! JSON lines on stdout, so it can sit behind any websocket bridge or replay
//! a recorded session. Logs go to stderr.

use realtime_session::runtime::{json_lines, JsonLinesTransport};
use realtime_session::state_machine::Notification;
use realtime_session::{RealtimeConfig, SessionRuntime, ToolRegistry};
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; stdout carries the wire
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_session=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = RealtimeConfig::from_env();
    let tools = ToolRegistry::standard().with_timeout(config.tool_timeout);
    tracing::info!(
        model = %config.model,
        voice = %config.voice,
        tools = tools.len(),
        "Starting realtime session"
    );

    let transport = JsonLinesTransport::new(tokio::io::stdout());
    let inbound = json_lines(BufReader::new(tokio::io::stdin()));
    let (runtime, handle) = SessionRuntime::new(config, transport, tools);

    tokio::spawn(present(handle.subscribe()));

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, closing session");
            shutdown.close();
        }
    });

    let store = runtime.run(inbound).await?;
    tracing::info!(
        items = store.len(),
        responses = store.responses().count(),
        "Session finished"
    );
    Ok(())
}

/// Presentation sink: turn notifications into log lines.
async fn present(mut notifications: broadcast::Receiver<Notification>) {
    loop {
        match notifications.recv().await {
            Ok(Notification::PartFinished {
                item_id,
                content_index,
                state,
                text,
            }) => {
                tracing::info!(item_id = %item_id, content_index, state = state.as_str(), text = %text, "Assistant");
            }
            Ok(Notification::TranscriptionCompleted {
                item_id,
                transcript,
                ..
            }) => {
                tracing::info!(item_id = %item_id, transcript = %transcript, "User");
            }
            Ok(Notification::ToolCallResolved {
                call_id,
                output,
                success,
            }) => {
                tracing::info!(call_id = %call_id, success, output = %output, "Tool result");
            }
            Ok(Notification::ResponseFinished {
                response_id,
                status,
                usage,
                latency,
            }) => {
                tracing::info!(
                    response_id = %response_id,
                    status = ?status,
                    total_tokens = usage.map_or(0, |u| u.total_tokens),
                    latency = ?latency,
                    "Response finished"
                );
            }
            Ok(other) => tracing::debug!(notification = other.kind(), "Notification"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Presentation fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
