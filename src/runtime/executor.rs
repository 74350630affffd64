//! Session runtime executor
//!
//! One task owns the [`SessionMachine`]. Inbound payloads, caller commands
//! and tool completions all pass through it in arrival order.

use super::traits::{ToolResolver, Transport};
use super::SessionHandle;
use crate::config::RealtimeConfig;
use crate::decoder::decode;
use crate::error::{SessionError, ToolError, TransportError};
use crate::state_machine::{transition, Effect, Event, Notification, SessionMachine, SessionStore};
use crate::tools::ToolContext;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Generic session runtime over any transport and tool resolver
pub struct SessionRuntime<T, R>
where
    T: Transport + 'static,
    R: ToolResolver + 'static,
{
    config: RealtimeConfig,
    machine: SessionMachine,
    transport: Arc<T>,
    tools: Arc<R>,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    broadcast_tx: broadcast::Sender<Notification>,
    /// Fired by [`SessionHandle::close`]
    shutdown: CancellationToken,
    /// Parent of every running tool's token
    tool_cancel: CancellationToken,
}

impl<T, R> SessionRuntime<T, R>
where
    T: Transport + 'static,
    R: ToolResolver + 'static,
{
    pub fn new(config: RealtimeConfig, transport: T, tools: R) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);
        let shutdown = CancellationToken::new();

        let handle = SessionHandle {
            event_tx: event_tx.clone(),
            broadcast_tx: broadcast_tx.clone(),
            shutdown: shutdown.clone(),
        };
        let runtime = Self {
            config,
            machine: SessionMachine::new(),
            transport: Arc::new(transport),
            tools: Arc::new(tools),
            event_rx,
            event_tx,
            broadcast_tx,
            shutdown,
            tool_cancel: CancellationToken::new(),
        };
        (runtime, handle)
    }

    /// Route events until the inbound stream ends, the handle closes the
    /// session, or the transport fails.
    ///
    /// Returns the final conversation model.
    pub async fn run<S>(mut self, inbound: S) -> Result<SessionStore, SessionError>
    where
        S: Stream<Item = Result<Vec<u8>, TransportError>>,
    {
        tracing::info!(model = %self.config.model, "Starting session runtime");

        let result = self.route(inbound).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Session runtime failed");
            let _ = self.broadcast_tx.send(Notification::Error(e.clone()));
        }

        self.tool_cancel.cancel();
        self.machine.close();
        tracing::info!(
            items = self.machine.store().len(),
            "Session runtime stopped"
        );
        result.map(|()| self.machine.into_store())
    }

    async fn route<S>(&mut self, inbound: S) -> Result<(), SessionError>
    where
        S: Stream<Item = Result<Vec<u8>, TransportError>>,
    {
        self.bootstrap().await?;

        let mut inbound = std::pin::pin!(inbound);
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    tracing::info!("Session closed by caller");
                    break;
                }

                Some(event) = self.event_rx.recv() => {
                    self.process_event(event).await?;
                }

                payload = inbound.next() => match payload {
                    Some(Ok(raw)) => match decode(&raw) {
                        Ok(event) => self.process_event(Event::Server(event)).await?,
                        Err(e) => {
                            tracing::warn!(error = %e, raw = %e.raw_preview(), "Dropping undecodable payload");
                            let _ = self.broadcast_tx.send(Notification::Error(e.into()));
                        }
                    },
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::info!("Inbound stream ended");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Configure the session, then send any initial prompts.
    async fn bootstrap(&mut self) -> Result<(), SessionError> {
        let session = self.config.session_config(self.tools.definitions());
        self.process_event(Event::UpdateSession(session)).await?;

        if !self.config.initial_prompts.is_empty() {
            let prompts = self.config.initial_prompts.clone();
            tracing::info!(count = prompts.len(), "Sending initial prompts");
            self.process_event(Event::UserText { prompts }).await?;
        }
        Ok(())
    }

    async fn process_event(&mut self, event: Event) -> Result<(), SessionError> {
        // Events generated by effects are handled before the next queued one
        let mut events_to_process = VecDeque::from([event]);

        while let Some(current_event) = events_to_process.pop_front() {
            let kind = current_event.kind().to_string();
            tracing::debug!(event = %kind, "Processing event");

            let result = match transition(&mut self.machine, current_event) {
                Ok(r) => r,
                Err(violation) => {
                    tracing::warn!(event = %kind, error = %violation, "Protocol violation");
                    let _ = self
                        .broadcast_tx
                        .send(Notification::Error(violation.into()));
                    continue;
                }
            };

            for effect in result.effects {
                if let Some(generated_event) = self.execute_effect(effect).await? {
                    events_to_process.push_back(generated_event);
                }
            }
        }

        Ok(())
    }

    /// Execute an effect and optionally return a generated event
    async fn execute_effect(&mut self, effect: Effect) -> Result<Option<Event>, SessionError> {
        match effect {
            Effect::Send(event) => {
                tracing::debug!(event = %event.event_type(), "Sending event");
                self.transport.send(&event).await?;
                Ok(None)
            }

            Effect::InvokeTool {
                call_id,
                name,
                arguments,
            } => {
                let Some(tool) = self.tools.resolve(&name) else {
                    tracing::warn!(call_id = %call_id, tool = %name, "No handler for tool");
                    return Ok(Some(Event::ToolFinished {
                        call_id: call_id.clone(),
                        outcome: Err(ToolError::UnknownTool { call_id, name }),
                    }));
                };

                let cancel_token = self.tool_cancel.child_token();
                let ctx = ToolContext::new(cancel_token.clone(), call_id.clone());
                let event_tx = self.event_tx.clone();

                tokio::spawn(async move {
                    tracing::info!(call_id = %call_id, tool = %name, "Executing tool (background)");

                    tokio::select! {
                        biased;

                        () = cancel_token.cancelled() => {
                            tracing::info!(call_id = %call_id, "Tool cancelled");
                        }

                        output = tool.run(arguments, ctx) => {
                            if let Err(e) = &output {
                                tracing::warn!(call_id = %call_id, tool = %name, error = %e, "Tool failed");
                            }
                            let outcome = output.map_err(|source| ToolError::Execution {
                                call_id: call_id.clone(),
                                source,
                            });
                            let _ = event_tx.send(Event::ToolFinished { call_id, outcome }).await;
                        }
                    }
                });

                // The result arrives later as Event::ToolFinished
                Ok(None)
            }

            Effect::Notify(notification) => {
                if let Notification::Error(e) = &notification {
                    tracing::warn!(kind = e.kind(), error = %e, "Session error");
                }
                // No subscribers is fine
                let _ = self.broadcast_tx.send(notification);
                Ok(None)
            }
        }
    }
}
