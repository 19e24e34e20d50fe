//! Connected sessions and room-wide broadcast.
//!
//! The registry is owned by the server and handed to handlers through
//! `AppState`. The execution core never sees it.

use gcode_core::SessionId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::events::ServerMessage;

const ROOM_CHANNEL_CAPACITY: usize = 256;
const ANONYMOUS: &str = "anonymous";

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Option<String>>>,
    room: broadcast::Sender<ServerMessage>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (room, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            sessions: Mutex::new(HashMap::new()),
            room,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.room.subscribe()
    }

    pub fn join(&self, session_id: &SessionId) {
        self.lock().insert(session_id.clone(), None);
        log::debug!("Session {} connected", session_id);
    }

    /// Name a session and broadcast the new presence list.
    pub fn set_username(&self, session_id: &SessionId, username: &str) -> Vec<String> {
        self.lock()
            .insert(session_id.clone(), Some(username.trim().to_string()));
        log::info!("Session {} is now '{}'", session_id, username.trim());
        self.broadcast_users()
    }

    /// Forget a session. The user list is only rebroadcast if it had a name.
    pub fn leave(&self, session_id: &SessionId) {
        let removed = self.lock().remove(session_id);
        log::debug!("Session {} disconnected", session_id);
        if let Some(Some(_)) = removed {
            self.broadcast_users();
        }
    }

    pub fn username(&self, session_id: &SessionId) -> Option<String> {
        self.lock().get(session_id).cloned().flatten()
    }

    /// Distinct usernames of connected sessions, sorted.
    pub fn users(&self) -> Vec<String> {
        self.lock()
            .values()
            .flatten()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn connected(&self) -> usize {
        self.lock().len()
    }

    pub fn broadcast_chat(&self, session_id: &SessionId, message: String) {
        let username = self
            .username(session_id)
            .unwrap_or_else(|| ANONYMOUS.to_string());
        self.broadcast(ServerMessage::ChatMessage {
            username,
            message,
            timestamp: chrono::Utc::now(),
        });
    }

    fn broadcast_users(&self) -> Vec<String> {
        let users = self.users();
        self.broadcast(ServerMessage::UserList {
            users: users.clone(),
        });
        users
    }

    fn broadcast(&self, message: ServerMessage) {
        // Fails only when nobody is subscribed.
        if self.room.send(message).is_err() {
            log::debug!("No subscribers for room broadcast");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Option<String>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
