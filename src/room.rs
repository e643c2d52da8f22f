//! Комната: локальный участник и не больше одного удалённого.

use crate::error::{CallError, Result};
use crate::peer::types::{ParticipantId, RoomId};
use crate::signaling::{OutboundSignal, SignalingRelay};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub const ROOM_CAPACITY: usize = 2;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    /// email/имя из `room:join`
    pub display: String,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(id: ParticipantId, display: impl Into<String>) -> Self {
        Self {
            id,
            display: display.into(),
            joined_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    members: Vec<Participant>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: Vec::with_capacity(ROOM_CAPACITY),
        }
    }

    pub fn members(&self) -> &[Participant] {
        &self.members
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|p| p.id == *id)
    }

    pub fn add(&mut self, participant: Participant) -> Result<()> {
        if self.members.len() >= ROOM_CAPACITY {
            return Err(CallError::RoomFull(self.id.to_string()));
        }
        self.members.push(participant);
        Ok(())
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let index = self.members.iter().position(|p| p.id == *id)?;
        Some(self.members.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub struct RoomCoordinator {
    relay: Arc<dyn SignalingRelay>,
    room: Option<Room>,
    local: Option<ParticipantId>,
}

impl RoomCoordinator {
    pub fn new(relay: Arc<dyn SignalingRelay>) -> Self {
        Self {
            relay,
            room: None,
            local: None,
        }
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn local_id(&self) -> Option<&ParticipantId> {
        self.local.as_ref()
    }

    pub async fn join(&mut self, room: RoomId, identity: &str) -> Result<ParticipantId> {
        if let Some(current) = &self.room {
            return Err(CallError::InvalidState(format!(
                "already in room {}",
                current.id
            )));
        }
        let id = self.relay.join(&room, identity).await?;
        let mut joined = Room::new(room);
        joined.add(Participant::new(id.clone(), identity))?;
        info!("Joined room {} as {id}", joined.id);
        self.room = Some(joined);
        self.local = Some(id.clone());
        Ok(id)
    }

    /// Единственный удалённый участник
    pub fn remote(&self) -> Option<&Participant> {
        let room = self.room.as_ref()?;
        room.members()
            .iter()
            .find(|p| Some(&p.id) != self.local.as_ref())
    }

    fn joined_room(&mut self) -> Result<&mut Room> {
        self.room
            .as_mut()
            .ok_or_else(|| CallError::InvalidState("not in a room".into()))
    }

    /// `user:joined`. Второй joined до left это ошибка учёта, не паника.
    pub fn on_user_joined(&mut self, id: ParticipantId, email: String) -> Result<Participant> {
        if self.local.as_ref() == Some(&id) {
            return Err(CallError::RoomError(format!("user:joined for self ({id})")));
        }
        if let Some(existing) = self.remote() {
            let message = format!(
                "user:joined for {id} while {} is still present",
                existing.id
            );
            warn!("{message}");
            return Err(CallError::RoomError(message));
        }
        let participant = Participant::new(id, email);
        self.joined_room()?.add(participant.clone())?;
        info!("Participant {} ({}) joined", participant.id, participant.display);
        Ok(participant)
    }

    /// Принимающая сторона узнаёт собеседника из `incoming:call`
    pub fn note_caller(&mut self, id: &ParticipantId) -> Result<()> {
        if let Some(existing) = self.remote() {
            if existing.id == *id {
                return Ok(());
            }
            return Err(CallError::RoomError(format!(
                "call from {id} while {} is the room peer",
                existing.id
            )));
        }
        self.joined_room()?
            .add(Participant::new(id.clone(), id.as_str()))
    }

    pub fn on_user_left(&mut self, id: &ParticipantId) -> Option<Participant> {
        if self.local.as_ref() == Some(id) {
            return None;
        }
        let left = self.room.as_mut()?.remove(id)?;
        info!("Participant {} left", left.id);
        Some(left)
    }

    /// Выход из комнаты; состояние сбрасывается даже если relay недоступен
    pub fn leave(&mut self) -> bool {
        let Some(room) = self.room.take() else {
            return false;
        };
        self.local = None;
        if !self.relay.send(OutboundSignal::RoomLeave { room: room.id }) {
            warn!("room:leave was not acknowledged");
        }
        true
    }
}
