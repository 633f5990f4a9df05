//! # State-Replication Server Library
//!
//! This library implements the authoritative hub of the multiplayer
//! state-replication service. The hub hosts a set of independent, long-lived
//! in-memory state containers ("contexts", keyed by opaque strings), accepts
//! full-duplex client connections that apply actions to a container, filters
//! and rewrites each action, applies it deterministically to the server's
//! copy of the state, and fans it out to every other connected client so all
//! participants converge on identical state.
//!
//! ## Architecture
//!
//! ### One Worker Per Context
//! Every context owns a single long-running task that processes its command
//! queue strictly in order. State is mutated nowhere else, which eliminates
//! races between concurrent dispatches without any per-field locking.
//! Contexts run fully in parallel with each other.
//!
//! ### Single-Flight Hydration
//! Contexts come into existence lazily: the first connection for a key
//! invokes the external hydrate collaborator, and every connection that
//! races with it awaits the same in-flight future. A key that names no
//! store is never cached, so a later attempt retries.
//!
//! ### Verifiable Client Ids
//! On connect, each client receives a signed UUIDv7 generation-parameter
//! bundle. Because id minting is deterministic over the issued seed, the
//! server can re-derive any id a client presents and prove it was produced
//! under server-issued parameters, without signing individual actions.
//!
//! ## Module Organization
//!
//! - [`keys`]: the persisted RSA keypair and the signed-parameter service
//! - [`registry`]: key to context map with single-flight creation
//! - [`context`]: state containers, rosters, and their serial workers
//! - [`pipeline`]: the connect/action ingestion pipeline
//! - [`session`]: socket to context binding and the session state machine
//! - [`network`]: listener, upgrades, and the shared [`network::Hub`]
//!
//! ## Collaborators
//!
//! The hub itself contains no application logic. Behavior is injected at
//! construction time:
//! - a **reducer** `(state, action) -> state`, pure and synchronous
//! - a **hydrate** callback loading initial state for a key (or reporting
//!   that the key does not exist)
//! - an **action filter** returning a [`context::Verdict`] per action
//!   (accept, rewrite, or fault)

pub mod context;
pub mod keys;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod session;

pub use context::{ClientEntry, ContextHandle, FilterCtx, Hooks, ReducerError, Verdict};
pub use keys::{GenParamService, ServerKeypair, DEFAULT_KEY_FILE};
pub use network::{Hub, Server};
pub use registry::{ContextRegistry, HydrateError, HydrateFn, RegistryError};
