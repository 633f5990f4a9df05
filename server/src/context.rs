//! Per-key state containers and their serial workers
//!
//! Every context key maps to exactly one [`ContextCore`]: the authoritative
//! state value, the id high-water mark, and the roster of attached clients.
//! A core is owned by a single long-running worker task and is never touched
//! from anywhere else: all mutation arrives as [`ContextCommand`] values
//! over the context's queue, processed strictly in FIFO order. That queue
//! discipline is what removes every race between concurrent dispatches,
//! attachments, and fan-out on the same key.
//!
//! Contexts run fully in parallel with each other; a worker never migrates
//! between contexts. When its queue is empty the worker parks on the channel
//! with a ten-second liveness probe and loops either way.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

use shared::uuid7::{self, GenState};
use shared::wire::{ServerMessage, SignedGenParams};

use crate::keys::GenParamService;
use crate::pipeline;

/// How long the worker sleeps on an empty queue before probing again.
const IDLE_PROBE: Duration = Duration::from_secs(10);

/// A state-mutating closure handed to [`FilterCtx::schedule`].
///
/// Runs on the owning context's worker, serialized with dispatches.
pub type ScheduledTask = Box<dyn FnOnce(&mut ContextCore) + Send>;

/// Everything a context worker knows how to do.
pub enum ContextCommand {
    /// Add a client to the roster.
    Attach(ClientEntry),
    /// Remove a client from the roster; idempotent.
    Detach(Uuid),
    /// Handle a `connect` handshake for an attached client.
    Connect {
        sender: Uuid,
        last_seen: String,
        client_id: Option<String>,
        uuid_params: Option<SignedGenParams>,
    },
    /// Run an action through the ingestion pipeline.
    Action {
        sender: Uuid,
        action_id: String,
        action_data: Value,
    },
    /// Run a deferred task scheduled by the action filter.
    Run(ScheduledTask),
}

/// The reducer failed; state must stay untouched.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ReducerError(pub String);

/// Pure state transition supplied at server construction, shared by all
/// contexts.
pub type ReducerFn = dyn Fn(&Value, &Value) -> Result<Value, ReducerError> + Send + Sync;

/// Per-action gatekeeper; see [`Verdict`].
pub type FilterFn = dyn Fn(&FilterCtx<'_>, &Value) -> Verdict + Send + Sync;

/// The user-supplied collaborators every context dispatches through.
pub struct Hooks {
    pub reducer: Box<ReducerFn>,
    pub filter: Box<FilterFn>,
}

/// Outcome of running the action filter.
///
/// `Accept` passes the action through unchanged; `Rewrite` substitutes a new
/// payload (and tells the sender via `replaceAction`). The three fault
/// variants stop the dispatch with state untouched, carrying an optional
/// operator-facing message.
pub enum Verdict {
    Accept,
    Rewrite(Value),
    Reject(Option<String>),
    NeedAuth(Option<String>),
    BadAuth(Option<String>),
}

/// What the action filter gets to see and do.
pub struct FilterCtx<'a> {
    key: &'a str,
    state: &'a Value,
    commands: &'a mpsc::UnboundedSender<ContextCommand>,
    sender_gen: Option<GenState>,
}

impl<'a> FilterCtx<'a> {
    pub(crate) fn new(core: &'a ContextCore, sender_gen: Option<GenState>) -> Self {
        Self {
            key: &core.key,
            state: &core.state,
            commands: &core.commands,
            sender_gen,
        }
    }

    /// The context key the action targets.
    pub fn key(&self) -> &str {
        self.key
    }

    /// The context state as of this dispatch.
    pub fn state(&self) -> &Value {
        self.state
    }

    /// Queues a task onto this context's worker. Never blocks; the task runs
    /// after the current dispatch completes.
    pub fn schedule(&self, task: impl FnOnce(&mut ContextCore) + Send + 'static) {
        let _ = self.commands.send(ContextCommand::Run(Box::new(task)));
    }

    /// Checks that `candidate` is a v7 id minted under the generation
    /// parameters issued to the sending client. Returns `false` when the
    /// sender never completed a handshake.
    pub fn verify_uuid(&self, candidate: &str) -> bool {
        self.sender_gen
            .as_ref()
            .map_or(false, |gen| uuid7::verify(gen, candidate))
    }
}

/// One attached client as the worker sees it.
///
/// Mutable per-client handshake state (`client_id`, `gen_state`) lives here
/// rather than on the socket task precisely so that only the worker ever
/// touches it.
pub struct ClientEntry {
    /// Server-minted fan-out identity; stable for the socket's lifetime.
    pub auto_client_id: Uuid,
    /// Client-supplied stable id, if any; informational.
    pub client_id: Option<String>,
    /// Generator state decoded from the bundle issued on `connect`.
    pub gen_state: Option<GenState>,
    /// Authenticated principal forwarded by the transport.
    pub identity: Option<String>,
    /// Outbound queue drained by the socket's write pump.
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientEntry {
    pub fn new(
        auto_client_id: Uuid,
        identity: Option<String>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            auto_client_id,
            client_id: None,
            gen_state: None,
            identity,
            outbound,
        }
    }

    /// Best-effort delivery; a closed session swallows the message.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }
}

/// Worker-owned core of one context.
pub struct ContextCore {
    pub(crate) key: String,
    pub(crate) state: Value,
    pub(crate) last_action_id: Uuid,
    pub(crate) id_gen: GenState,
    pub(crate) clients: HashMap<Uuid, ClientEntry>,
    pub(crate) commands: mpsc::UnboundedSender<ContextCommand>,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) params: Arc<GenParamService>,
}

impl ContextCore {
    /// The context's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current authoritative state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Id of the most recent accepted action; lower bound for client ids.
    pub fn last_action_id(&self) -> Uuid {
        self.last_action_id
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Mints the next authoritative UUIDv7 for this context.
    pub(crate) fn mint_action_id(&mut self) -> Uuid {
        uuid7::mint(&mut self.id_gen, None, None)
    }

    fn attach(&mut self, entry: ClientEntry) {
        debug!(
            "context '{}': client {} attached ({} total)",
            self.key,
            entry.auto_client_id,
            self.clients.len() + 1
        );
        self.clients.insert(entry.auto_client_id, entry);
    }

    fn detach(&mut self, auto_client_id: &Uuid) {
        if self.clients.remove(auto_client_id).is_some() {
            info!(
                "context '{}': client {} detached ({} left)",
                self.key,
                auto_client_id,
                self.clients.len()
            );
        }
    }

    /// Sends `message` to every attached client except `exclude`.
    pub(crate) fn fan_out(&self, exclude: Uuid, message: &ServerMessage) {
        for entry in self.clients.values() {
            if entry.auto_client_id == exclude {
                continue;
            }
            entry.send(message.clone());
        }
    }

    fn execute(&mut self, command: ContextCommand) {
        match command {
            ContextCommand::Attach(entry) => self.attach(entry),
            ContextCommand::Detach(id) => self.detach(&id),
            ContextCommand::Connect {
                sender,
                last_seen,
                client_id,
                uuid_params,
            } => pipeline::connect(self, sender, last_seen, client_id, uuid_params),
            ContextCommand::Action {
                sender,
                action_id,
                action_data,
            } => pipeline::action(self, sender, action_id, action_data),
            ContextCommand::Run(task) => task(self),
        }
    }
}

/// Cloneable reference to a context's command queue.
#[derive(Clone)]
pub struct ContextHandle {
    key: String,
    commands: mpsc::UnboundedSender<ContextCommand>,
}

impl ContextHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Enqueues a command for the worker. Safe from any task, never blocks;
    /// a command sent after server shutdown is quietly dropped.
    pub fn schedule(&self, command: ContextCommand) {
        let _ = self.commands.send(command);
    }
}

/// Creates a context around `initial_state` and starts its worker.
pub fn spawn_context(
    key: String,
    initial_state: Value,
    hooks: Arc<Hooks>,
    params: Arc<GenParamService>,
) -> ContextHandle {
    let (commands, inbox) = mpsc::unbounded_channel();

    let mut id_gen = GenState::fresh(uuid7::now_ms());
    let last_action_id = uuid7::mint(&mut id_gen, None, None);

    let core = ContextCore {
        key: key.clone(),
        state: initial_state,
        last_action_id,
        id_gen,
        clients: HashMap::new(),
        commands: commands.clone(),
        hooks,
        params,
    };
    tokio::spawn(run_worker(core, inbox));

    ContextHandle { key, commands }
}

/// The serial execution region of one context.
async fn run_worker(mut core: ContextCore, mut inbox: mpsc::UnboundedReceiver<ContextCommand>) {
    loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(command) => {
                    let outcome =
                        std::panic::catch_unwind(AssertUnwindSafe(|| core.execute(command)));
                    if outcome.is_err() {
                        error!("context '{}': task panicked; worker continues", core.key);
                    }
                }
                None => {
                    debug!("context '{}': queue closed, worker exiting", core.key);
                    break;
                }
            },
            _ = sleep(IDLE_PROBE) => {
                debug!("context '{}': idle", core.key);
            }
        }
    }
}
