//! Action ingestion pipeline
//!
//! Both pipeline entry points run inside the owning context's worker, so
//! everything here may read and write the core without further locking.
//!
//! `connect` settles the client's generation parameters (verify a presented
//! bundle or mint a fresh one) and answers with a state snapshot. `action`
//! applies the id policy, consults the filter, applies the reducer,
//! answers the sender, and fans the accepted action out to every peer.
//!
//! Errors never escape a dispatch: a malformed payload is dropped, a filter
//! fault answers only the sender, and a reducer failure is logged with state
//! left untouched.

use log::{debug, error};
use serde_json::Value;
use uuid::Uuid;

use shared::uuid7::{self, GenState};
use shared::wire::{ServerMessage, SignedGenParams};

use crate::context::{ContextCore, FilterCtx, Verdict};

/// Fallback text for filter faults that carry no message of their own.
fn default_fault_message(response_type: &str) -> String {
    format!("no extra message given for {response_type}")
}

/// Handles a `connect` handshake from an attached client.
///
/// An unverifiable presented bundle is silently discarded in favor of a
/// fresh one; the client learns the parameters in force from the reply.
pub fn connect(
    core: &mut ContextCore,
    sender: Uuid,
    last_seen: String,
    client_id: Option<String>,
    uuid_params: Option<SignedGenParams>,
) {
    if !last_seen.is_empty() {
        debug!(
            "context '{}': ignoring lastSeen resume hint from {}",
            core.key, sender
        );
    }

    let state_snapshot = core.state.clone();
    let params = core.params.clone();
    let Some(entry) = core.clients.get_mut(&sender) else {
        debug!("context '{}': {} left before connect was handled", core.key, sender);
        return;
    };

    if let Some(id) = client_id {
        entry.client_id = Some(id);
    }

    let bundle = match uuid_params {
        Some(presented) if params.verify(&presented) => presented,
        Some(_) => {
            debug!(
                "context '{}': discarding unverifiable uuid params from {}",
                core.key, sender
            );
            params.mint_signed()
        }
        None => params.mint_signed(),
    };

    let Some(gen) = GenState::decode(&bundle.init_bytes) else {
        error!("context '{}': generation parameters have a malformed seed block", core.key);
        return;
    };
    entry.gen_state = Some(gen);

    entry.send(ServerMessage::Connected {
        initial_state: state_snapshot,
        client_id: entry
            .client_id
            .clone()
            .unwrap_or_else(|| entry.auto_client_id.to_string()),
        uuid_params: bundle,
    });
}

/// Runs one `action` message through id policy, filter, reducer, response,
/// and fan-out.
pub fn action(core: &mut ContextCore, sender: Uuid, action_id: String, action_data: Value) {
    // Non-object payloads are dropped before they can reach the reducer.
    if !action_data.is_object() {
        debug!(
            "context '{}': dropping non-object action payload from {}",
            core.key, sender
        );
        return;
    }

    // Id policy: accept the client's id only if it is a well-formed v7
    // strictly above the high-water mark and not ahead of our own mint.
    let next = core.mint_action_id();
    let id = match uuid7::parse(&action_id) {
        Some(claimed)
            if uuid7::is_v7(&claimed) && claimed > core.last_action_id && claimed <= next =>
        {
            claimed
        }
        _ => next,
    };

    let (sender_gen, sender_outbound) = match core.clients.get(&sender) {
        Some(entry) => (entry.gen_state, Some(entry.outbound.clone())),
        None => (None, None),
    };

    let verdict = {
        let ctx = FilterCtx::new(core, sender_gen);
        (core.hooks.filter)(&ctx, &action_data)
    };

    let (accepted, replaced) = match verdict {
        Verdict::Accept => (action_data, false),
        Verdict::Rewrite(rewritten) => (rewritten, true),
        Verdict::Reject(message) => {
            respond(
                sender_outbound,
                ServerMessage::RejectAction {
                    message: message.unwrap_or_else(|| default_fault_message("rejectAction")),
                    action_id,
                },
            );
            return;
        }
        Verdict::NeedAuth(message) => {
            respond(
                sender_outbound,
                ServerMessage::NeedAuthentication {
                    action_id,
                    message: message.unwrap_or_else(|| default_fault_message("needAuthentication")),
                },
            );
            return;
        }
        Verdict::BadAuth(message) => {
            respond(
                sender_outbound,
                ServerMessage::BadAuthorization {
                    action_id,
                    message: message.unwrap_or_else(|| default_fault_message("badAuthorization")),
                },
            );
            return;
        }
    };

    match (core.hooks.reducer)(&core.state, &accepted) {
        Ok(new_state) => core.state = new_state,
        Err(err) => {
            // Recover inside the worker: log, keep state, answer nobody.
            error!("context '{}': reducer failed: {}", core.key, err);
            return;
        }
    }
    core.last_action_id = id;

    let id_text = id.to_string();
    let response = if replaced {
        ServerMessage::ReplaceAction {
            from_id: action_id,
            to_id: id_text.clone(),
            action: accepted.clone(),
        }
    } else if id_text != action_id {
        ServerMessage::RenameId {
            from_id: action_id,
            to_id: id_text.clone(),
        }
    } else {
        ServerMessage::AckAction { id: action_id }
    };
    respond(sender_outbound, response);

    core.fan_out(
        sender,
        &ServerMessage::Action {
            action: accepted,
            id: id_text,
        },
    );
}

fn respond(
    outbound: Option<tokio::sync::mpsc::UnboundedSender<ServerMessage>>,
    message: ServerMessage,
) {
    if let Some(tx) = outbound {
        let _ = tx.send(message);
    }
}
