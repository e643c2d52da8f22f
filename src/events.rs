//! События для UI и явный реестр подписчиков вместо глобальных emit_*.

use crate::call::{CallState, MuteState};
use crate::messenger::ChatMessage;
use crate::peer::transport::ConnectionState;
use crate::peer::types::{ParticipantId, RemoteTrack, RoomId};
use crate::utils::lock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    RoomJoined { room: RoomId, id: ParticipantId },
    PeerJoined { id: ParticipantId, email: String },
    PeerLeft { id: ParticipantId },
    StateChanged { state: CallState },
    /// Удалённая сторона сообщила, что звонит
    RemoteRinging { from: ParticipantId },
    ConnectionChanged { state: ConnectionState },
    RemoteTrack { track: RemoteTrack },
    Chat { message: ChatMessage },
    MuteChanged { mute: MuteState },
    Warning { message: String },
    Error { message: String },
}

pub type SubscriptionId = u64;
pub type EventHandler = Arc<dyn Fn(&CallEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, EventHandler)>>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.subscribers).push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Подписчики вызываются вне блокировки и могут отписываться сами
    pub fn emit(&self, event: &CallEvent) {
        let handlers: Vec<EventHandler> = lock(&self.subscribers)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}
