//! Relay в памяти процесса: та же маршрутизация, что у внешнего сервера.
//! Используется в тестах и для демонстрации двух клиентов в одном процессе.

use crate::error::{CallError, Result};
use crate::peer::types::{ParticipantId, RoomId};
use crate::room::ROOM_CAPACITY;
use crate::signaling::{
    EventKind, HandlerTable, InboundSignal, OutboundSignal, SignalHandler, SignalingRelay,
};
use crate::utils::lock;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Сколько последних пересланных сигналов хранит журнал
pub const ROUTED_LOG_CAPACITY: usize = 512;

/// Запись о пересланном сигнале
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedSignal {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub signal: InboundSignal,
}

struct Member {
    email: String,
    room: Option<RoomId>,
    handlers: Arc<HandlerTable>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<RoomId, Vec<ParticipantId>>,
    members: HashMap<ParticipantId, Member>,
    routed: VecDeque<RoutedSignal>,
}

pub struct LocalRelay {
    next_id: AtomicU64,
    available: AtomicBool,
    state: Mutex<HubState>,
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            state: Mutex::new(HubState::default()),
        })
    }

    /// Новое подключение; id выдаёт relay, как socket id
    pub fn connect(self: &Arc<Self>) -> Arc<LocalRelayClient> {
        let id = ParticipantId::new(format!(
            "sock-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let handlers = Arc::new(HandlerTable::default());
        lock(&self.state).members.insert(
            id.clone(),
            Member {
                email: String::new(),
                room: None,
                handlers: handlers.clone(),
            },
        );
        debug!("Relay client {id} connected");
        Arc::new(LocalRelayClient {
            hub: self.clone(),
            id,
            handlers,
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn room_members(&self, room: &RoomId) -> Vec<ParticipantId> {
        lock(&self.state).rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn room_exists(&self, room: &RoomId) -> bool {
        lock(&self.state).rooms.contains_key(room)
    }

    /// Последние пересланные сигналы, старые вытесняются
    pub fn routed(&self) -> Vec<RoutedSignal> {
        lock(&self.state).routed.iter().cloned().collect()
    }

    pub fn take_routed(&self) -> Vec<RoutedSignal> {
        lock(&self.state).routed.drain(..).collect()
    }

    fn join(&self, id: &ParticipantId, room: &RoomId, email: &str) -> Result<()> {
        if !self.is_available() {
            return Err(CallError::RelayUnavailable("local relay is down".into()));
        }
        let mut deliveries = Vec::new();
        let outcome = {
            let mut state = lock(&self.state);
            let occupants = state.rooms.get(room).cloned().unwrap_or_default();
            if occupants.contains(id) {
                Err(CallError::InvalidState(format!("{id} already in room {room}")))
            } else if occupants.len() >= ROOM_CAPACITY {
                if let Some(me) = state.members.get(id) {
                    let full = InboundSignal::RoomFull { room: room.clone() };
                    deliveries.push((me.handlers.clone(), full));
                }
                Err(CallError::RoomFull(room.to_string()))
            } else {
                for other in &occupants {
                    if let Some(member) = state.members.get(other) {
                        deliveries.push((
                            member.handlers.clone(),
                            InboundSignal::UserJoined {
                                email: email.to_string(),
                                id: id.clone(),
                            },
                        ));
                    }
                }
                state.rooms.entry(room.clone()).or_default().push(id.clone());
                if let Some(me) = state.members.get_mut(id) {
                    me.email = email.to_string();
                    me.room = Some(room.clone());
                    deliveries.push((
                        me.handlers.clone(),
                        InboundSignal::RoomJoined {
                            room: room.clone(),
                            id: Some(id.clone()),
                        },
                    ));
                }
                Ok(())
            }
        };
        for (handlers, signal) in deliveries {
            handlers.dispatch(signal);
        }
        if outcome.is_ok() {
            info!("{id} ({email}) joined room {room}");
        }
        outcome
    }

    /// Убирает участника из комнаты и оповещает остальных. Пустая комната
    /// удаляется.
    fn leave(&self, id: &ParticipantId) {
        let mut deliveries = Vec::new();
        {
            let mut state = lock(&self.state);
            let Some(room) = state.members.get_mut(id).and_then(|m| m.room.take()) else {
                return;
            };
            let remaining = match state.rooms.get_mut(&room) {
                Some(occupants) => {
                    occupants.retain(|p| p != id);
                    occupants.clone()
                }
                None => Vec::new(),
            };
            if remaining.is_empty() {
                state.rooms.remove(&room);
                debug!("Room {room} destroyed");
            }
            for other in remaining {
                if let Some(member) = state.members.get(&other) {
                    deliveries.push(member.handlers.clone());
                }
            }
        }
        for handlers in deliveries {
            handlers.dispatch(InboundSignal::UserLeft { id: id.clone() });
        }
    }

    fn disconnect(&self, id: &ParticipantId) {
        self.leave(id);
        lock(&self.state).members.remove(id);
        debug!("Relay client {id} disconnected");
    }

    fn route(&self, from: &ParticipantId, signal: OutboundSignal) -> bool {
        if !self.is_available() {
            return false;
        }
        match signal {
            OutboundSignal::RoomJoin { .. } => {
                warn!("room:join must go through join()");
                false
            }
            OutboundSignal::RoomLeave { .. } => {
                self.leave(from);
                true
            }
            signal => {
                let Some((to, inbound)) = signal.route(from.clone()) else {
                    return false;
                };
                let handlers = {
                    let mut state = lock(&self.state);
                    let Some(handlers) = state.members.get(&to).map(|m| m.handlers.clone()) else {
                        debug!("Dropping {} for unknown {to}", inbound.kind().as_str());
                        return false;
                    };
                    if state.routed.len() == ROUTED_LOG_CAPACITY {
                        state.routed.pop_front();
                    }
                    state.routed.push_back(RoutedSignal {
                        from: from.clone(),
                        to: to.clone(),
                        signal: inbound.clone(),
                    });
                    handlers
                };
                handlers.dispatch(inbound);
                true
            }
        }
    }
}

/// Подключение одного участника к [`LocalRelay`]
pub struct LocalRelayClient {
    hub: Arc<LocalRelay>,
    id: ParticipantId,
    handlers: Arc<HandlerTable>,
}

impl LocalRelayClient {
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Обрыв соединения: остальные получают `user:left`
    pub fn disconnect(&self) {
        self.hub.disconnect(&self.id);
    }
}

#[async_trait]
impl SignalingRelay for LocalRelayClient {
    async fn join(&self, room: &RoomId, identity: &str) -> Result<ParticipantId> {
        self.hub.join(&self.id, room, identity)?;
        Ok(self.id.clone())
    }

    fn send(&self, signal: OutboundSignal) -> bool {
        self.hub.route(&self.id, signal)
    }

    fn on_event(&self, kind: EventKind, handler: SignalHandler) {
        self.handlers.register(kind, handler);
    }

    fn off_event(&self, kind: EventKind) -> bool {
        self.handlers.remove(kind)
    }

    fn local_id(&self) -> Option<ParticipantId> {
        Some(self.id.clone())
    }
}
