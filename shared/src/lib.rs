//! # Shared Replication Protocol Library
//!
//! This crate contains everything the state-replication server and its
//! clients must agree on: the JSON wire protocol and the deterministic
//! UUIDv7 identifier codec.
//!
//! ## Core Components
//!
//! ### Wire Protocol
//! The [`wire`] module defines the complete message taxonomy exchanged over
//! a connection:
//! - **Handshake**: `connect` in, `connected` / `invalidStore` out
//! - **Dispatch**: `action` in; `ackAction`, `renameId`, `replaceAction`,
//!   `rejectAction`, `needAuthentication`, `badAuthorization` back to the
//!   sender
//! - **Fan-out**: `action` broadcast to every peer of the sender
//!
//! ### Identifier Codec
//! The [`uuid7`] module builds, parses, and introspects time-ordered UUIDv7
//! values. Its mint is deterministic over a seed: the server issues each
//! client a signed seed bundle and can later reconstruct any id the client
//! minted, proving the id's origin without per-action signatures.
//!
//! ## Design Philosophy
//!
//! ### Determinism
//! Identifier generation avoids all ambient randomness once a seed is
//! fixed, so client and server derive identical bytes from identical
//! inputs. This is what makes cheap id verification possible.
//!
//! ### Serialization
//! All wire structures implement `Serialize` and `Deserialize` and travel
//! as JSON text frames; binary blobs (seeds, signatures) are base-64
//! encoded strings on the wire.

pub mod uuid7;
pub mod wire;

pub use uuid7::GenState;
pub use wire::{ClientMessage, ServerMessage, SignedGenParams};
