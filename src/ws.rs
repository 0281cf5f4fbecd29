use std::collections::{HashMap, HashSet};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::{api::AppState, rooms};

const EVENT_BUFFER: usize = 100;

/// Process-local map of room name to its broadcast channel. Membership
/// lives here only; nothing validates a room name against the rooms table,
/// and a name is whatever the client supplied in-band.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the channel backing a room.
    pub fn channel(&self, room_id: &str) -> broadcast::Sender<String> {
        let mut guard = self.rooms.lock();
        guard
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
            .clone()
    }

    /// Deliver a payload to every connection currently joined to the room.
    /// Returns the number of members reached; a room with no members is not
    /// an error.
    pub fn broadcast(&self, room_id: &str, payload: String) -> usize {
        let tx = self.rooms.lock().get(room_id).cloned();
        match tx {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .lock()
            .get(room_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Inbound gateway events.
#[derive(Debug, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        room_id: String,
    },
    Send {
        room_id: String,
        sender_id: String,
        text: String,
    },
}

/// Outbound gateway events.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        room_id: String,
        sender: String,
        text: String,
        timestamp: i64,
    },
}

/// Drive one client connection until it closes.
///
/// Join subscribes the connection to the room's channel (idempotent per
/// connection; joining more rooms stacks subscriptions). Send persists to
/// the room's embedded log on a best-effort basis and then broadcasts to
/// current members regardless of the persistence outcome.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Single writer task; per-room forwarders feed it over an mpsc channel.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    let mut joined: HashSet<String> = HashSet::new();
    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("ignoring unparseable gateway event: {e}");
                continue;
            }
        };
        match event {
            ClientEvent::Join { room_id } => {
                if joined.contains(&room_id) {
                    continue;
                }
                let mut rx = BroadcastStream::new(state.registry.channel(&room_id).subscribe());
                let out = out_tx.clone();
                forwarders.push(tokio::spawn(async move {
                    while let Some(item) = rx.next().await {
                        // lagged receivers skip what they missed
                        let Ok(payload) = item else { continue };
                        if out.send(payload).is_err() {
                            break;
                        }
                    }
                }));
                joined.insert(room_id);
            }
            ClientEvent::Send {
                room_id,
                sender_id,
                text,
            } => {
                relay_message(&state, &room_id, &sender_id, &text);
            }
        }
    }

    for task in forwarders {
        task.abort();
    }
    writer.abort();
}

/// Build the message, attempt the embedded-log append, broadcast either way.
/// Persistence failures are logged and swallowed; the sender is never told.
pub fn relay_message(state: &AppState, room_id: &str, sender_id: &str, text: &str) -> usize {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    match state.pool.get() {
        Ok(conn) => {
            if let Err(e) = rooms::append_room_message(&conn, room_id, sender_id, text, timestamp)
            {
                tracing::warn!("failed to persist message for room {room_id}: {e}");
            }
        }
        Err(e) => tracing::warn!("failed to persist message for room {room_id}: {e}"),
    }
    let event = ServerEvent::NewMessage {
        room_id: room_id.to_string(),
        sender: sender_id.to_string(),
        text: text.to_string(),
        timestamp,
    };
    let payload = serde_json::to_string(&event).expect("event serializes");
    state.registry.broadcast(room_id, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_is_shared_per_room() {
        let registry = RoomRegistry::new();
        let a = registry.channel("algebra-101");
        let mut rx = a.subscribe();
        // a second lookup hits the same channel
        let b = registry.channel("algebra-101");
        b.send("x".into()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "x");
        // a different room does not
        assert_eq!(registry.broadcast("poetry", "y".into()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_every_member() {
        let registry = RoomRegistry::new();
        let mut rx1 = registry.channel("r").subscribe();
        let mut rx2 = registry.channel("r").subscribe();
        assert_eq!(registry.member_count("r"), 2);
        let reached = registry.broadcast("r", "hello".into());
        assert_eq!(reached, 2);
        assert_eq!(rx1.try_recv().unwrap(), "hello");
        assert_eq!(rx2.try_recv().unwrap(), "hello");
    }

    #[test]
    fn broadcast_to_empty_room_is_not_an_error() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.broadcast("nobody-here", "hello".into()), 0);
        // a room whose members all dropped behaves the same
        let rx = registry.channel("r").subscribe();
        drop(rx);
        assert_eq!(registry.broadcast("r", "hello".into()), 0);
        assert_eq!(registry.member_count("r"), 0);
    }

    #[test]
    fn event_wire_format() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"t":"join","room_id":"algebra-101"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Join { ref room_id } if room_id == "algebra-101"));
        let event: ClientEvent = serde_json::from_str(
            r#"{"t":"send","room_id":"algebra-101","sender_id":"s1","text":"hello"}"#,
        )
        .unwrap();
        assert!(matches!(event, ClientEvent::Send { ref text, .. } if text == "hello"));

        let out = ServerEvent::NewMessage {
            room_id: "algebra-101".into(),
            sender: "s1".into(),
            text: "hello".into(),
            timestamp: 7,
        };
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains(r#""t":"new_message""#));
        assert!(json.contains(r#""timestamp":7"#));
    }
}
