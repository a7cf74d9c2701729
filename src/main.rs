mod config;
mod router;
mod session;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::router::SessionEvent;
use crate::session::{Connections, Directory, SessionCommand, SessionHandle};
use crate::types::{ClientMsg, ServerMsg};

#[derive(Clone)]
struct AppState {
    directory: Arc<Directory>,
    connections: Arc<Connections>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let participant_id = state.connections.register();
    tracing::info!("connection established: {}", participant_id);

    // The read loop subscribes to a session's router before sending the join
    // command, then hands the subscription over here once the session has
    // admitted the participant. Handshake events emitted in between sit in
    // the subscription's buffer, so none are lost.
    let (sub_tx, mut sub_rx) = mpsc::channel::<broadcast::Receiver<SessionEvent>>(1);

    let sender_clone = sender.clone();
    let my_id = participant_id.clone();

    let event_task = tokio::spawn(async move {
        while let Some(mut event_rx) = sub_rx.recv().await {
            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        let Some(msg) = event.for_recipient(&my_id) else {
                            continue;
                        };
                        if let Ok(json) = serde_json::to_string(msg) {
                            let mut s = sender_clone.lock().await;
                            if s.send(Message::Text(json.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("connection {} lagged, dropped {} events", my_id, n);
                        continue;
                    }
                    // Session reaped; wait for a fresh subscription in case
                    // the connection rejoins.
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    // The session this connection joined, set only once a join is confirmed.
    let mut current_session: Option<SessionHandle> = None;

    // Process incoming frames.
    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("invalid frame from {}: {}", participant_id, e);
                continue;
            }
        };

        match client_msg {
            ClientMsg::Join { game_id, name } => {
                // A closed mailbox means the previous session reaped itself;
                // that connection may join again.
                if current_session
                    .as_ref()
                    .is_some_and(|h| !h.cmd_tx.is_closed())
                {
                    send_msg(
                        &sender,
                        &ServerMsg::Error {
                            message: "already in a game".to_string(),
                        },
                    )
                    .await;
                    continue;
                }

                let handle = state.directory.get_or_create(&game_id);

                // Subscribe before the session can emit the handshake, so
                // welcome/admin/membership events are buffered for the
                // forwarder instead of broadcast to nobody.
                let event_rx = handle.router.subscribe();

                let (reply_tx, reply_rx) = oneshot::channel();
                if handle
                    .cmd_tx
                    .send(SessionCommand::Join {
                        participant_id: participant_id.clone(),
                        name,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    send_msg(
                        &sender,
                        &ServerMsg::Error {
                            message: "game no longer exists, rejoin".to_string(),
                        },
                    )
                    .await;
                    continue;
                }

                match reply_rx.await {
                    Ok(Ok(())) => {
                        let _ = sub_tx.send(event_rx).await;
                        current_session = Some(handle);
                    }
                    Ok(Err(message)) => {
                        send_msg(&sender, &ServerMsg::Error { message }).await;
                    }
                    Err(_) => {
                        send_msg(
                            &sender,
                            &ServerMsg::Error {
                                message: "game no longer exists, rejoin".to_string(),
                            },
                        )
                        .await;
                    }
                }
            }

            ClientMsg::StartGame { game_id } => {
                let Some(handle) = joined_session(&state, &participant_id, &game_id) else {
                    reject_unjoined(&sender, &participant_id, &game_id).await;
                    continue;
                };
                let _ = handle
                    .cmd_tx
                    .send(SessionCommand::Start {
                        participant_id: participant_id.clone(),
                    })
                    .await;
            }

            ClientMsg::Answer { game_id, content } => {
                let Some(handle) = joined_session(&state, &participant_id, &game_id) else {
                    reject_unjoined(&sender, &participant_id, &game_id).await;
                    continue;
                };
                let _ = handle
                    .cmd_tx
                    .send(SessionCommand::Submit {
                        participant_id: participant_id.clone(),
                        content,
                    })
                    .await;
            }

            ClientMsg::Draw { game_id, points } => {
                // Strokes are high-volume; a stale or unjoined sender is
                // dropped without a reply.
                let Some(handle) = joined_session(&state, &participant_id, &game_id) else {
                    continue;
                };
                let _ = handle
                    .cmd_tx
                    .send(SessionCommand::Stroke {
                        participant_id: participant_id.clone(),
                        stroke: points,
                    })
                    .await;
            }
        }
    }

    // Socket disconnected.
    tracing::info!("connection closed: {}", participant_id);
    event_task.abort();

    // `unregister` yields the bound session at most once, so leave fires
    // exactly once no matter how the disconnect was detected.
    if let Some(game_id) = state.connections.unregister(&participant_id) {
        if let Some(handle) = state.directory.get(&game_id) {
            let _ = handle
                .cmd_tx
                .send(SessionCommand::Leave {
                    participant_id: participant_id.clone(),
                })
                .await;
        }
    }
}

/// Resolves a session-scoped message against the session this connection
/// actually joined; a mismatched or unknown identifier yields nothing.
fn joined_session(state: &AppState, participant_id: &str, game_id: &str) -> Option<SessionHandle> {
    if state.connections.game_of(participant_id).as_deref() != Some(game_id) {
        return None;
    }
    state.directory.get(game_id)
}

async fn reject_unjoined(
    sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>,
    participant_id: &str,
    game_id: &str,
) {
    tracing::warn!("{} referenced unjoined game {}", participant_id, game_id);
    send_msg(
        sender,
        &ServerMsg::Error {
            message: "not a member of that game".to_string(),
        },
    )
    .await;
}

async fn send_msg(sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>, msg: &ServerMsg) {
    if let Ok(json) = serde_json::to_string(msg) {
        let mut s = sender.lock().await;
        let _ = s.send(Message::Text(json.into())).await;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    config::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()
        .expect("Invalid PORT");

    let prompts = config::load_prompts();
    if prompts.is_empty() {
        tracing::warn!("prompt corpus is empty; games will start with a blank prompt");
    }

    let connections = Connections::new();
    let directory = Directory::new(connections.clone(), prompts);

    let state = AppState {
        directory,
        connections,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .fallback_service(ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind");

    tracing::info!("scrawl server running on port {}", port);

    axum::serve(listener, app).await.unwrap();
}
