//! Connection sessions
//!
//! One session binds one accepted socket to one context. Its lifecycle is a
//! three-state machine:
//!
//! | state     | while in it                                   |
//! |-----------|-----------------------------------------------|
//! | Buffering | context lookup in flight; frames are queued   |
//! | Live      | attached; frames go straight to the worker    |
//! | Closed    | socket gone; roster entry scheduled for removal |
//!
//! Hydration can take arbitrarily long, so the Buffering phase keeps
//! reading the socket: early frames land in a bounded inbox and are
//! replayed in arrival order once the context attaches. A socket that
//! closes mid-hydration aborts silently; a key that names no store answers
//! `{invalidStore}` and closes.
//!
//! Writes never happen from the session task itself. Every outbound frame
//! goes through an unbounded channel drained by a write pump, so sends from
//! the context worker are non-blocking and best-effort.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

use shared::wire::{ClientMessage, ServerMessage};

use crate::context::{ClientEntry, ContextCommand, ContextHandle};
use crate::network::Hub;

/// Most messages a session will hold while its context hydrates; beyond
/// this the connection is dropped.
pub const PENDING_INBOX_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Buffering,
    Live,
    Closed,
}

/// Server-side half of one client connection.
pub struct Session {
    auto_client_id: Uuid,
    context_key: String,
    identity: Option<String>,
    phase: Phase,
    pending_inbox: VecDeque<ClientMessage>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    fn new(
        auto_client_id: Uuid,
        context_key: String,
        identity: Option<String>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            auto_client_id,
            context_key,
            identity,
            phase: Phase::Buffering,
            pending_inbox: VecDeque::new(),
            outbound,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    /// Queues a raw frame received while Buffering. Returns `false` when
    /// the inbox is full and the connection should be dropped.
    fn buffer(&mut self, text: &str) -> bool {
        debug_assert_eq!(self.phase, Phase::Buffering);
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => {
                if self.pending_inbox.len() >= PENDING_INBOX_LIMIT {
                    return false;
                }
                self.pending_inbox.push_back(message);
                true
            }
            Err(err) => {
                warn!(
                    "session {}: unparseable frame while buffering: {}",
                    self.auto_client_id, err
                );
                true
            }
        }
    }

    /// Decodes and routes one live frame.
    fn handle_text(&self, context: &ContextHandle, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.route(context, message),
            Err(err) => warn!(
                "session {}: unparseable frame: {}",
                self.auto_client_id, err
            ),
        }
    }

    /// Hands a decoded message to the context worker.
    fn route(&self, context: &ContextHandle, message: ClientMessage) {
        let sender = self.auto_client_id;
        match message {
            ClientMessage::Connect {
                last_seen,
                client_id,
                uuid_params,
            } => context.schedule(ContextCommand::Connect {
                sender,
                last_seen,
                client_id,
                uuid_params,
            }),
            ClientMessage::Action {
                action_id,
                action_data,
            } => context.schedule(ContextCommand::Action {
                sender,
                action_id,
                action_data,
            }),
        }
    }
}

/// Drives one accepted WebSocket until it closes.
pub async fn run(
    hub: Arc<Hub>,
    ws: WebSocketStream<TcpStream>,
    context_key: String,
    identity: Option<String>,
) {
    let (sink, mut stream) = ws.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_pump(outbound_rx, sink));

    let auto_client_id = hub.mint_session_id().await;
    let mut session = Session::new(auto_client_id, context_key, identity, outbound);

    // Buffering: race socket reads against the context lookup.
    let registry = Arc::clone(&hub.registry);
    let key = session.context_key.clone();
    let identity = session.identity.clone();
    let mut attachment = Box::pin(async move { registry.get_or_create(&key, identity).await });

    let outcome = loop {
        tokio::select! {
            outcome = &mut attachment => break outcome,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !session.buffer(&text) {
                        warn!(
                            "session {}: pending inbox overflow, dropping connection",
                            session.auto_client_id
                        );
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    // Hydration may still complete for other waiters.
                    debug!(
                        "session {}: socket closed during hydration",
                        session.auto_client_id
                    );
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(
                        "session {}: socket error during hydration: {}",
                        session.auto_client_id, err
                    );
                    return;
                }
            }
        }
    };

    let context = match outcome {
        Ok(Some(context)) => context,
        Ok(None) => {
            info!(
                "session {}: unknown store '{}'",
                session.auto_client_id, session.context_key
            );
            session.send(ServerMessage::InvalidStore);
            // Dropping the outbound sender lets the pump flush and close.
            return;
        }
        Err(err) => {
            warn!("session {}: {}", session.auto_client_id, err);
            return;
        }
    };

    context.schedule(ContextCommand::Attach(ClientEntry::new(
        session.auto_client_id,
        session.identity.clone(),
        session.outbound.clone(),
    )));
    session.phase = Phase::Live;
    info!(
        "session {} live on context '{}'",
        session.auto_client_id, session.context_key
    );

    // Replay everything that arrived while hydrating, in arrival order.
    while let Some(message) = session.pending_inbox.pop_front() {
        session.route(&context, message);
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(&context, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("session {}: socket error: {}", session.auto_client_id, err);
                break;
            }
        }
    }

    session.phase = Phase::Closed;
    // Removal rides the worker queue so it serializes with fan-out.
    context.schedule(ContextCommand::Detach(session.auto_client_id));
    info!("session {} closed", session.auto_client_id);
}

/// Drains a session's outbound queue into its socket.
async fn write_pump(
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(err) => {
                error!("failed to encode outbound frame: {}", err);
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            // Cleanup rides on the read half noticing the close.
            break;
        }
    }
    let _ = sink.close().await;
}
