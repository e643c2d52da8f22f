//! Протокол relay и клиентский интерфейс к нему.
//!
//! Кадры имеют вид `{"event": "<name>", "data": {...}}`. Клиент шлёт
//! [`OutboundSignal`] с адресатом `to`, relay доставляет адресату
//! [`InboundSignal`] с отправителем `from`.

use crate::error::Result;
use crate::peer::types::{IceCandidate, ParticipantId, RoomId, SessionDescription};
use crate::utils::lock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Client → relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum OutboundSignal {
    #[serde(rename = "room:join")]
    RoomJoin { email: String, room: RoomId },
    #[serde(rename = "room:leave")]
    RoomLeave { room: RoomId },
    #[serde(rename = "user:call")]
    UserCall {
        to: ParticipantId,
        offer: SessionDescription,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted {
        to: ParticipantId,
        ans: SessionDescription,
    },
    #[serde(rename = "peer:nego:needed")]
    NegoNeeded {
        offer: SessionDescription,
        to: ParticipantId,
    },
    #[serde(rename = "peer:nego:done")]
    NegoDone {
        to: ParticipantId,
        ans: SessionDescription,
    },
    #[serde(rename = "peer:ice:candidate")]
    IceCandidate {
        to: ParticipantId,
        candidate: IceCandidate,
    },
    #[serde(rename = "call:initiated")]
    CallInitiated { to: ParticipantId },
    #[serde(rename = "call:end")]
    CallEnd { to: ParticipantId },
}

impl OutboundSignal {
    pub fn target(&self) -> Option<&ParticipantId> {
        match self {
            OutboundSignal::RoomJoin { .. } | OutboundSignal::RoomLeave { .. } => None,
            OutboundSignal::UserCall { to, .. }
            | OutboundSignal::CallAccepted { to, .. }
            | OutboundSignal::NegoNeeded { to, .. }
            | OutboundSignal::NegoDone { to, .. }
            | OutboundSignal::IceCandidate { to, .. }
            | OutboundSignal::CallInitiated { to }
            | OutboundSignal::CallEnd { to } => Some(to),
        }
    }

    /// Адресная пересылка так, как её делает relay: адресат и то, что он
    /// получит. Для комнатных событий `None`.
    pub fn route(self, from: ParticipantId) -> Option<(ParticipantId, InboundSignal)> {
        let routed = match self {
            OutboundSignal::RoomJoin { .. } | OutboundSignal::RoomLeave { .. } => return None,
            OutboundSignal::UserCall { to, offer } => {
                (to, InboundSignal::IncomingCall { from, offer })
            }
            OutboundSignal::CallAccepted { to, ans } => {
                (to, InboundSignal::CallAccepted { from, ans })
            }
            OutboundSignal::NegoNeeded { offer, to } => {
                (to, InboundSignal::NegoNeeded { from, offer })
            }
            OutboundSignal::NegoDone { to, ans } => (to, InboundSignal::NegoFinal { from, ans }),
            OutboundSignal::IceCandidate { to, candidate } => {
                (to, InboundSignal::IceCandidate { from, candidate })
            }
            OutboundSignal::CallInitiated { to } => (to, InboundSignal::CallInitiated { from }),
            OutboundSignal::CallEnd { to } => (to, InboundSignal::CallEnd { from }),
        };
        Some(routed)
    }
}

/// Relay → client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum InboundSignal {
    /// Подтверждение входа в комнату
    #[serde(rename = "room:join")]
    RoomJoined {
        room: RoomId,
        #[serde(default)]
        id: Option<ParticipantId>,
    },
    #[serde(rename = "room:full")]
    RoomFull { room: RoomId },
    #[serde(rename = "user:joined")]
    UserJoined { email: String, id: ParticipantId },
    #[serde(rename = "user:left")]
    UserLeft { id: ParticipantId },
    #[serde(rename = "incoming:call")]
    IncomingCall {
        from: ParticipantId,
        offer: SessionDescription,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted {
        from: ParticipantId,
        ans: SessionDescription,
    },
    #[serde(rename = "peer:nego:needed")]
    NegoNeeded {
        from: ParticipantId,
        offer: SessionDescription,
    },
    #[serde(rename = "peer:nego:final")]
    NegoFinal {
        from: ParticipantId,
        ans: SessionDescription,
    },
    #[serde(rename = "peer:ice:candidate")]
    IceCandidate {
        from: ParticipantId,
        candidate: IceCandidate,
    },
    #[serde(rename = "call:initiated")]
    CallInitiated { from: ParticipantId },
    #[serde(rename = "call:end")]
    CallEnd { from: ParticipantId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RoomJoined,
    RoomFull,
    UserJoined,
    UserLeft,
    IncomingCall,
    CallAccepted,
    NegoNeeded,
    NegoFinal,
    IceCandidate,
    CallInitiated,
    CallEnd,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::RoomJoined,
        EventKind::RoomFull,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::IncomingCall,
        EventKind::CallAccepted,
        EventKind::NegoNeeded,
        EventKind::NegoFinal,
        EventKind::IceCandidate,
        EventKind::CallInitiated,
        EventKind::CallEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RoomJoined => "room:join",
            EventKind::RoomFull => "room:full",
            EventKind::UserJoined => "user:joined",
            EventKind::UserLeft => "user:left",
            EventKind::IncomingCall => "incoming:call",
            EventKind::CallAccepted => "call:accepted",
            EventKind::NegoNeeded => "peer:nego:needed",
            EventKind::NegoFinal => "peer:nego:final",
            EventKind::IceCandidate => "peer:ice:candidate",
            EventKind::CallInitiated => "call:initiated",
            EventKind::CallEnd => "call:end",
        }
    }
}

impl InboundSignal {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundSignal::RoomJoined { .. } => EventKind::RoomJoined,
            InboundSignal::RoomFull { .. } => EventKind::RoomFull,
            InboundSignal::UserJoined { .. } => EventKind::UserJoined,
            InboundSignal::UserLeft { .. } => EventKind::UserLeft,
            InboundSignal::IncomingCall { .. } => EventKind::IncomingCall,
            InboundSignal::CallAccepted { .. } => EventKind::CallAccepted,
            InboundSignal::NegoNeeded { .. } => EventKind::NegoNeeded,
            InboundSignal::NegoFinal { .. } => EventKind::NegoFinal,
            InboundSignal::IceCandidate { .. } => EventKind::IceCandidate,
            InboundSignal::CallInitiated { .. } => EventKind::CallInitiated,
            InboundSignal::CallEnd { .. } => EventKind::CallEnd,
        }
    }
}

pub type SignalHandler = Arc<dyn Fn(InboundSignal) + Send + Sync>;

/// Ровно один обработчик на тип события; повторная регистрация заменяет
/// предыдущий.
#[derive(Default)]
pub struct HandlerTable {
    handlers: Mutex<HashMap<EventKind, SignalHandler>>,
}

impl HandlerTable {
    pub fn register(&self, kind: EventKind, handler: SignalHandler) {
        if lock(&self.handlers).insert(kind, handler).is_some() {
            debug!("Replaced handler for {}", kind.as_str());
        }
    }

    pub fn remove(&self, kind: EventKind) -> bool {
        lock(&self.handlers).remove(&kind).is_some()
    }

    /// Вызывает обработчик вне блокировки; `false` если его нет
    pub fn dispatch(&self, signal: InboundSignal) -> bool {
        let handler = lock(&self.handlers).get(&signal.kind()).cloned();
        match handler {
            Some(handler) => {
                handler(signal);
                true
            }
            None => {
                debug!("No handler for {}, dropping", signal.kind().as_str());
                false
            }
        }
    }
}

/// Тонкая обёртка над внешним relay. Доставка fire-and-forget без повторов:
/// `send` возвращает `false`, если отправка не подтверждена.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn join(&self, room: &RoomId, identity: &str) -> Result<ParticipantId>;
    fn send(&self, signal: OutboundSignal) -> bool;
    fn on_event(&self, kind: EventKind, handler: SignalHandler);
    fn off_event(&self, kind: EventKind) -> bool;
    fn local_id(&self) -> Option<ParticipantId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[test]
    fn test_outbound_wire_shape() {
        let signal = OutboundSignal::UserCall {
            to: pid("b"),
            offer: SessionDescription::offer("v=0"),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "user:call",
                "data": {"to": "b", "offer": {"type": "offer", "sdp": "v=0"}}
            })
        );
    }

    #[test]
    fn test_inbound_parse() {
        let raw = r#"{"event":"user:joined","data":{"email":"b@example.org","id":"sock-2"}}"#;
        let signal: InboundSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(
            signal,
            InboundSignal::UserJoined {
                email: "b@example.org".into(),
                id: pid("sock-2")
            }
        );
        let ack: InboundSignal =
            serde_json::from_str(r#"{"event":"room:join","data":{"room":"42"}}"#).unwrap();
        assert_eq!(
            ack,
            InboundSignal::RoomJoined {
                room: RoomId::new("42"),
                id: None
            }
        );
    }

    #[test]
    fn test_route_nego_done_becomes_final() {
        let (target, inbound) = OutboundSignal::NegoDone {
            to: pid("a"),
            ans: SessionDescription::answer("v=0"),
        }
        .route(pid("b"))
        .unwrap();
        assert_eq!(target, pid("a"));
        assert_eq!(inbound.kind(), EventKind::NegoFinal);
        assert!(matches!(inbound, InboundSignal::NegoFinal { from, .. } if from == pid("b")));
        assert!(OutboundSignal::RoomLeave {
            room: RoomId::new("1")
        }
        .route(pid("b"))
        .is_none());
    }

    #[test]
    fn test_handler_replaced_and_removed() {
        let table = HandlerTable::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        table.register(
            EventKind::CallEnd,
            Arc::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let s = second.clone();
        table.register(
            EventKind::CallEnd,
            Arc::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(table.dispatch(InboundSignal::CallEnd { from: pid("a") }));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(table.remove(EventKind::CallEnd));
        assert!(!table.dispatch(InboundSignal::CallEnd { from: pid("a") }));
    }

    #[test]
    fn test_kind_names_match_wire() {
        let signal = InboundSignal::CallInitiated { from: pid("a") };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["event"], signal.kind().as_str());
    }
}
