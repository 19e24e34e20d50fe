//! WebSocket relay between one client and the shared room.
//!
//! Each connection gets a generated session id. Chat and presence go through
//! the `SessionRegistry` broadcast; run results go only to the connection
//! that asked for them. Closing the socket cancels that session's executions.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use gcode_core::{ExecutionNotice, ExecutionRequest, SessionId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::events::{ClientMessage, ServerMessage};
use crate::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = SessionId::generate();
    state.sessions.join(&session_id);
    log::info!("WebSocket session {} opened", session_id);

    let (mut sink, mut stream) = socket.split();
    let mut room = state.sessions.subscribe();
    let (direct_tx, mut direct_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<ExecutionNotice>();

    reply(
        &direct_tx,
        &session_id,
        ServerMessage::UserList {
            users: state.sessions.users(),
        },
    );

    let writer_session = session_id.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(message) = direct_rx.recv() => message,
                Some(notice) = notice_rx.recv() => ServerMessage::from(notice),
                broadcast = room.recv() => match broadcast {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Session {} missed {} room messages", writer_session, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("Failed to serialize message for {}: {}", writer_session, e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state, &session_id, text.as_str(), &direct_tx, &notice_tx);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error on session {}: {}", session_id, e);
                    break;
                }
            },
            // The writer stops once the client can no longer be reached.
            _ = &mut writer => break,
        }
    }

    let cancelled = state.dispatcher.cancel_session(&session_id);
    state.sessions.leave(&session_id);
    writer.abort();
    log::info!(
        "WebSocket session {} closed ({} execution(s) cancelled)",
        session_id,
        cancelled
    );
}

fn handle_client_text(
    state: &AppState,
    session_id: &SessionId,
    text: &str,
    direct_tx: &mpsc::UnboundedSender<ServerMessage>,
    notice_tx: &mpsc::UnboundedSender<ExecutionNotice>,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("Unreadable message from {}: {}", session_id, e);
            reply(direct_tx, session_id, ServerMessage::error(format!("Invalid message: {}", e)));
            return;
        }
    };

    match message {
        ClientMessage::SetUsername { username } => {
            if username.trim().is_empty() {
                reply(direct_tx, session_id, ServerMessage::error("Username must not be empty"));
                return;
            }
            state.sessions.set_username(session_id, &username);
        }
        ClientMessage::SendMessage { message } => {
            state.sessions.broadcast_chat(session_id, message);
        }
        ClientMessage::RunCode {
            language,
            code,
            stdin,
        } => {
            let mut request = ExecutionRequest::new(session_id.clone(), language, code);
            request.stdin = stdin;
            let execution_id = state.dispatcher.submit(request, notice_tx.clone());
            log::debug!("Session {} started execution {}", session_id, execution_id);
        }
        ClientMessage::CancelRun => {
            let cancelled = state.dispatcher.cancel_session(session_id);
            if cancelled == 0 {
                reply(direct_tx, session_id, ServerMessage::error("No execution in progress"));
            }
        }
    }
}

/// Queue a message for this connection's writer only.
fn reply(direct_tx: &mpsc::UnboundedSender<ServerMessage>, session_id: &SessionId, message: ServerMessage) {
    if direct_tx.send(message).is_err() {
        log::debug!("Session {} writer is gone, reply dropped", session_id);
    }
}
