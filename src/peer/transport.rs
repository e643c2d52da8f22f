//! Capability interfaces над соединением: ядро работает только через них,
//! реализация на webrtc-rs лежит в `connection`, фейки в `crate::mock`.

use crate::error::Result;
use crate::media::MediaTrack;
use crate::peer::types::{IceCandidate, RemoteTrack, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Номер CallSession; события прошлых сессий отбрасываются по нему
pub type SessionId = u64;

/// Уникальный номер объекта data channel внутри процесса
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Асинхронные события соединения
#[derive(Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// Канал, открытый удалённой стороной
    RemoteChannel(Arc<dyn DataChannel>),
    ChannelOpened(ChannelId),
    ChannelMessage { channel: ChannelId, text: String },
    ChannelClosed(ChannelId),
    RemoteTrack(RemoteTrack),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            PeerEvent::RemoteChannel(dc) => f.debug_tuple("RemoteChannel").field(&dc.id()).finish(),
            PeerEvent::ChannelOpened(id) => f.debug_tuple("ChannelOpened").field(id).finish(),
            PeerEvent::ChannelMessage { channel, text } => f
                .debug_struct("ChannelMessage")
                .field("channel", channel)
                .field("len", &text.len())
                .finish(),
            PeerEvent::ChannelClosed(id) => f.debug_tuple("ChannelClosed").field(id).finish(),
            PeerEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(t).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: PeerEvent,
}

/// Куда соединение отдаёт свои события; помечает их номером сессии
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerEventSink {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// `false` если цикл событий уже остановлен
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Один объект peer connection
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    /// Откат неотвеченного локального offer (glare, вежливая сторона)
    async fn rollback_local_description(&self) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;
    /// Надёжный канал с сохранением порядка
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, sink: PeerEventSink) -> Result<Arc<dyn ConnectionTransport>>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
