//! Integration tests for the state-replication server
//!
//! These tests validate cross-component interactions over real loopback
//! WebSockets: handshake, dispatch, fan-out, and hydration behavior.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use server::context::{Hooks, ReducerError, Verdict};
use server::keys::ServerKeypair;
use server::network::Server;
use server::registry::HydrateFn;
use shared::uuid7::{self, GenState};
use shared::wire::{ClientMessage, ServerMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// RSA keygen dominates test time, so every server shares one small key.
fn test_keypair() -> ServerKeypair {
    static KEYPAIR: OnceLock<ServerKeypair> = OnceLock::new();
    KEYPAIR
        .get_or_init(|| ServerKeypair::generate(512).unwrap())
        .clone()
}

/// Counting reducer used across scenarios: `{type: "inc"}` bumps `count`.
fn counting_reducer(state: &Value, action: &Value) -> Result<Value, ReducerError> {
    if action["type"] != json!("inc") {
        return Err(ReducerError(format!("unknown action {}", action["type"])));
    }
    let count = state["count"].as_i64().unwrap_or(0);
    Ok(json!({"count": count + 1}))
}

fn counting_hooks(filter: Box<server::context::FilterFn>) -> Arc<Hooks> {
    Arc::new(Hooks {
        reducer: Box::new(counting_reducer),
        filter,
    })
}

fn accept_all() -> Box<server::context::FilterFn> {
    Box::new(|_ctx, _action| Verdict::Accept)
}

/// Hydrate returning `{count: 0}` for every key.
fn open_hydrate() -> Arc<HydrateFn> {
    Arc::new(|_key, _identity| async { Ok(Some(json!({"count": 0}))) }.boxed())
}

async fn start_server(hydrate: Arc<HydrateFn>, hooks: Arc<Hooks>) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0", test_keypair(), hydrate, hooks)
        .await
        .expect("failed to bind test server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn open_socket(addr: SocketAddr, key: &str) -> Socket {
    let (socket, _response) = connect_async(format!("ws://{}/{}", addr, key))
        .await
        .expect("websocket connect failed");
    socket
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let text = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(text)).await.unwrap();
}

/// Reads frames until the next text frame, decoded as a server message.
async fn next_message(socket: &mut Socket) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed unexpectedly")
            .expect("socket errored");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("unparseable server frame");
        }
    }
}

/// Performs the connect handshake and returns the issued generator state
/// plus the snapshot the server reported.
async fn handshake(socket: &mut Socket) -> (GenState, Value) {
    send(
        socket,
        &ClientMessage::Connect {
            last_seen: String::new(),
            client_id: None,
            uuid_params: None,
        },
    )
    .await;

    match next_message(socket).await {
        ServerMessage::Connected {
            initial_state,
            uuid_params,
            ..
        } => {
            let gen = GenState::decode(&uuid_params.init_bytes).expect("bad seed block");
            (gen, initial_state)
        }
        other => panic!("expected connected, got {:?}", other),
    }
}

/// CONNECTION HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    /// A fresh store answers `connected` with the hydrated snapshot and a
    /// verifiable parameter bundle.
    #[tokio::test]
    async fn connect_returns_snapshot_and_parameters() {
        let addr = start_server(open_hydrate(), counting_hooks(accept_all())).await;
        let mut socket = open_socket(addr, "room/a").await;

        send(
            &mut socket,
            &ClientMessage::Connect {
                last_seen: String::new(),
                client_id: Some("stable-me".to_string()),
                uuid_params: None,
            },
        )
        .await;

        match next_message(&mut socket).await {
            ServerMessage::Connected {
                initial_state,
                client_id,
                uuid_params,
            } => {
                assert_eq!(initial_state, json!({"count": 0}));
                assert_eq!(client_id, "stable-me");
                assert!(GenState::decode(&uuid_params.init_bytes).is_some());
            }
            other => panic!("expected connected, got {:?}", other),
        }
    }

    /// Without a supplied client id, the server assigns its own v7 id.
    #[tokio::test]
    async fn connect_assigns_an_auto_client_id() {
        let addr = start_server(open_hydrate(), counting_hooks(accept_all())).await;
        let mut socket = open_socket(addr, "room/a").await;

        send(
            &mut socket,
            &ClientMessage::Connect {
                last_seen: String::new(),
                client_id: None,
                uuid_params: None,
            },
        )
        .await;

        match next_message(&mut socket).await {
            ServerMessage::Connected { client_id, .. } => {
                let id = uuid7::parse(&client_id).expect("clientId is not a uuid");
                assert!(uuid7::is_v7(&id));
            }
            other => panic!("expected connected, got {:?}", other),
        }
    }

    /// A key the hydrate collaborator does not know yields `invalidStore`
    /// and a closed socket.
    #[tokio::test]
    async fn unknown_store_is_refused_and_closed() {
        let hydrate: Arc<HydrateFn> = Arc::new(|key, _identity| {
            async move {
                if key == "room/ghost" {
                    Ok(None)
                } else {
                    Ok(Some(json!({"count": 0})))
                }
            }
            .boxed()
        });
        let addr = start_server(hydrate, counting_hooks(accept_all())).await;
        let mut socket = open_socket(addr, "room/ghost").await;

        send(
            &mut socket,
            &ClientMessage::Connect {
                last_seen: String::new(),
                client_id: None,
                uuid_params: None,
            },
        )
        .await;

        assert!(matches!(
            next_message(&mut socket).await,
            ServerMessage::InvalidStore
        ));

        // The server closes after the refusal.
        let rest = timeout(Duration::from_secs(5), async {
            while let Some(frame) = socket.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        })
        .await;
        assert!(rest.is_ok(), "socket was not closed");
    }
}

/// DISPATCH AND FAN-OUT TESTS
mod dispatch_tests {
    use super::*;

    /// An accepted action is applied and acknowledged to its sender.
    #[tokio::test]
    async fn action_is_applied_and_acknowledged() {
        let addr = start_server(open_hydrate(), counting_hooks(accept_all())).await;
        let mut socket = open_socket(addr, "room/a").await;
        let (mut gen, snapshot) = handshake(&mut socket).await;
        assert_eq!(snapshot, json!({"count": 0}));

        // Mint under the issued parameters, a beat after context creation.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let action_id = uuid7::mint(&mut gen, None, None).to_string();
        send(
            &mut socket,
            &ClientMessage::Action {
                action_id: action_id.clone(),
                action_data: json!({"type": "inc"}),
            },
        )
        .await;

        // Client and server mint in the same millisecond range, so the id
        // may be accepted as-is or renamed; either way it was applied.
        match next_message(&mut socket).await {
            ServerMessage::AckAction { id } => assert_eq!(id, action_id),
            ServerMessage::RenameId { from_id, .. } => assert_eq!(from_id, action_id),
            other => panic!("expected ack or rename, got {:?}", other),
        }

        // A second client sees the incremented state.
        let mut witness = open_socket(addr, "room/a").await;
        let (_, seen) = handshake(&mut witness).await;
        assert_eq!(seen, json!({"count": 1}));
    }

    /// Accepted actions reach every peer exactly once, never their sender.
    #[tokio::test]
    async fn fan_out_excludes_the_sender() {
        let addr = start_server(open_hydrate(), counting_hooks(accept_all())).await;

        let mut alice = open_socket(addr, "room/a").await;
        let mut bob = open_socket(addr, "room/a").await;
        let (mut alice_gen, _) = handshake(&mut alice).await;
        let (mut bob_gen, _) = handshake(&mut bob).await;

        let alice_action = uuid7::mint(&mut alice_gen, None, None).to_string();
        send(
            &mut alice,
            &ClientMessage::Action {
                action_id: alice_action,
                action_data: json!({"type": "inc"}),
            },
        )
        .await;

        // Bob hears Alice's action.
        match next_message(&mut bob).await {
            ServerMessage::Action { action, .. } => {
                assert_eq!(action, json!({"type": "inc"}));
            }
            other => panic!("expected fan-out action, got {:?}", other),
        }

        // Alice got her response but no echo: after Bob dispatches one,
        // the next frame Alice sees is Bob's action, not her own.
        match next_message(&mut alice).await {
            ServerMessage::AckAction { .. } | ServerMessage::RenameId { .. } => {}
            other => panic!("expected ack or rename, got {:?}", other),
        }

        let bob_action = uuid7::mint(&mut bob_gen, None, None).to_string();
        send(
            &mut bob,
            &ClientMessage::Action {
                action_id: bob_action.clone(),
                action_data: json!({"type": "inc"}),
            },
        )
        .await;

        match next_message(&mut alice).await {
            ServerMessage::Action { .. } => {}
            other => panic!("expected bob's action, got {:?}", other),
        }
    }

    /// A rejecting filter answers the sender with the default message and
    /// leaves peers silent.
    #[tokio::test]
    async fn rejected_action_answers_sender_only() {
        let filter: Box<server::context::FilterFn> = Box::new(|_ctx, action| {
            if action["type"] == json!("forbidden") {
                Verdict::Reject(None)
            } else {
                Verdict::Accept
            }
        });
        let addr = start_server(open_hydrate(), counting_hooks(filter)).await;

        let mut socket = open_socket(addr, "room/a").await;
        let (mut gen, _) = handshake(&mut socket).await;

        let action_id = uuid7::mint(&mut gen, None, None).to_string();
        send(
            &mut socket,
            &ClientMessage::Action {
                action_id: action_id.clone(),
                action_data: json!({"type": "forbidden"}),
            },
        )
        .await;

        match next_message(&mut socket).await {
            ServerMessage::RejectAction { message, action_id: rejected } => {
                assert_eq!(message, "no extra message given for rejectAction");
                assert_eq!(rejected, action_id);
            }
            other => panic!("expected rejectAction, got {:?}", other),
        }

        // State unchanged: a new connection still sees count 0.
        let mut witness = open_socket(addr, "room/a").await;
        let (_, seen) = handshake(&mut witness).await;
        assert_eq!(seen, json!({"count": 0}));
    }

    /// A rewriting filter sends `replaceAction` to the sender and the
    /// rewritten payload to peers.
    #[tokio::test]
    async fn rewritten_action_is_replaced_for_the_sender() {
        let filter: Box<server::context::FilterFn> = Box::new(|_ctx, action| {
            let mut stamped = action.as_object().cloned().unwrap_or_default();
            stamped.insert("serverStamp".to_string(), json!("X"));
            Verdict::Rewrite(Value::Object(stamped))
        });
        let addr = start_server(open_hydrate(), counting_hooks(filter)).await;

        let mut sender = open_socket(addr, "room/a").await;
        let mut peer = open_socket(addr, "room/a").await;
        let (mut gen, _) = handshake(&mut sender).await;
        let (_, _) = handshake(&mut peer).await;

        let action_id = uuid7::mint(&mut gen, None, None).to_string();
        send(
            &mut sender,
            &ClientMessage::Action {
                action_id: action_id.clone(),
                action_data: json!({"type": "inc"}),
            },
        )
        .await;

        let expected = json!({"type": "inc", "serverStamp": "X"});
        match next_message(&mut sender).await {
            ServerMessage::ReplaceAction { from_id, action, .. } => {
                assert_eq!(from_id, action_id);
                assert_eq!(action, expected);
            }
            other => panic!("expected replaceAction, got {:?}", other),
        }
        match next_message(&mut peer).await {
            ServerMessage::Action { action, .. } => assert_eq!(action, expected),
            other => panic!("expected fan-out action, got {:?}", other),
        }
    }
}

/// HYDRATION TESTS
mod hydration_tests {
    use super::*;

    /// Two sockets racing for a cold key trigger exactly one hydrate call
    /// and both connect against the same snapshot, even though their
    /// handshakes arrived while hydration was still in flight.
    #[tokio::test]
    async fn concurrent_connects_hydrate_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let hydrate: Arc<HydrateFn> = Arc::new(move |_key, _identity| {
            counted.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Some(json!({"count": 0})))
            }
            .boxed()
        });
        let addr = start_server(hydrate, counting_hooks(accept_all())).await;

        let mut first = open_socket(addr, "room/b").await;
        let mut second = open_socket(addr, "room/b").await;

        // Both handshakes land in the pending inbox during hydration.
        let ((_, state_a), (_, state_b)) =
            tokio::join!(handshake(&mut first), handshake(&mut second));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state_a, json!({"count": 0}));
        assert_eq!(state_b, json!({"count": 0}));
    }

    /// A refused key is retried on the next connection attempt.
    #[tokio::test]
    async fn refused_keys_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let hydrate: Arc<HydrateFn> = Arc::new(move |_key, _identity| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok(None::<Value>) }.boxed()
        });
        let addr = start_server(hydrate, counting_hooks(accept_all())).await;

        for _ in 0..2 {
            let mut socket = open_socket(addr, "room/ghost").await;
            send(
                &mut socket,
                &ClientMessage::Connect {
                    last_seen: String::new(),
                    client_id: None,
                    uuid_params: None,
                },
            )
            .await;
            assert!(matches!(
                next_message(&mut socket).await,
                ServerMessage::InvalidStore
            ));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
