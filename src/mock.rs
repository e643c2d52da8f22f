//! Фейковые реализации capability-интерфейсов для детерминированных тестов:
//! соединения связываются через [`FakeNetwork`] по полю `o=` в SDP,
//! медиа и relay записывают всё, что с ними делали.

use crate::error::{CallError, Result};
use crate::media::{LocalMedia, MediaConstraints, MediaSource, MediaTrack};
use crate::peer::transport::{
    next_channel_id, ChannelId, ConnectionFactory, ConnectionTransport, DataChannel, PeerEvent,
    PeerEventSink,
};
use crate::peer::types::{
    IceCandidate, ParticipantId, RemoteTrack, RoomId, SdpType, SessionDescription, TrackKind,
};
use crate::signaling::{EventKind, HandlerTable, OutboundSignal, SignalHandler, SignalingRelay};
use crate::utils::lock;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

// ========== MEDIA ==========

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stop_calls: AtomicUsize,
}

static NEXT_TRACK: AtomicU64 = AtomicU64::new(1);

impl FakeTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("fake-{:?}-{}", kind, NEXT_TRACK.fetch_add(1, Ordering::Relaxed)),
            kind,
            enabled: AtomicBool::new(true),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop_calls() > 0
    }
}

#[derive(Debug, Default)]
pub struct FakeMediaSource {
    failing: AtomicBool,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Следующие захваты падают с `MediaUnavailable`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Все выданные треки в порядке выдачи
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        lock(&self.tracks).clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CallError::MediaUnavailable("permission denied".into()));
        }
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        let mut issued = lock(&self.tracks);
        let tracks: Vec<Arc<dyn MediaTrack>> = kinds
            .into_iter()
            .map(|kind| {
                let track = Arc::new(FakeTrack::new(kind));
                issued.push(track.clone());
                track as Arc<dyn MediaTrack>
            })
            .collect();
        Ok(LocalMedia::new(format!("fake-stream-{}", issued.len()), tracks))
    }
}

// ========== RELAY ==========

/// Relay, который только записывает отправленное; входящие события
/// подаются через [`RecordingRelay::deliver`].
pub struct RecordingRelay {
    id: ParticipantId,
    available: AtomicBool,
    sent: Mutex<Vec<OutboundSignal>>,
    handlers: HandlerTable,
}

impl RecordingRelay {
    pub fn new(id: &str) -> Self {
        Self {
            id: ParticipantId::new(id),
            available: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            handlers: HandlerTable::default(),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        lock(&self.sent).clone()
    }

    pub fn take_sent(&self) -> Vec<OutboundSignal> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

#[async_trait]
impl SignalingRelay for RecordingRelay {
    async fn join(&self, room: &RoomId, identity: &str) -> Result<ParticipantId> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CallError::RelayUnavailable("recording relay is down".into()));
        }
        lock(&self.sent).push(OutboundSignal::RoomJoin {
            email: identity.to_string(),
            room: room.clone(),
        });
        Ok(self.id.clone())
    }

    fn send(&self, signal: OutboundSignal) -> bool {
        lock(&self.sent).push(signal);
        self.available.load(Ordering::SeqCst)
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

// ========== CONNECTIONS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddCandidate,
    CreateChannel,
}

/// Общая «сеть» фейковых соединений. Откат локального offer по умолчанию
/// отклоняется, как в webrtc-rs 0.13; [`FakeNetwork::with_rollback`]
/// даёт поведение браузера.
#[derive(Default)]
pub struct FakeNetwork {
    next_id: AtomicU64,
    rollback: bool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            rollback: false,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn with_rollback() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            rollback: true,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<FakeConnectionFactory> {
        Arc::new(FakeConnectionFactory {
            network: self.clone(),
        })
    }

    /// Соединения в порядке создания
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        lock(&self.connections).clone()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<FakeConnection>> {
        lock(&self.connections).get(index).cloned()
    }

    fn find(&self, id: u64) -> Option<Arc<FakeConnection>> {
        lock(&self.connections).iter().find(|c| c.id == id).cloned()
    }
}

pub struct FakeConnectionFactory {
    network: Arc<FakeNetwork>,
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn connect(&self, sink: PeerEventSink) -> Result<Arc<dyn ConnectionTransport>> {
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(FakeConnection {
            id,
            sink,
            network: Arc::downgrade(&self.network),
            inner: Mutex::new(FakeConnState::default()),
        });
        lock(&self.network.connections).push(conn.clone());
        Ok(conn)
    }
}

#[derive(Default)]
struct FakeConnState {
    version: u64,
    local: Option<SessionDescription>,
    previous_local: Option<SessionDescription>,
    /// have-local-offer
    offer_pending: bool,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: Vec<Arc<dyn MediaTrack>>,
    announced: HashSet<String>,
    channels: Vec<Arc<FakeDataChannel>>,
    offers_created: usize,
    rollbacks: usize,
    close_calls: usize,
    closed: bool,
    candidate_sent: bool,
    failures: HashSet<FakeOp>,
}

pub struct FakeConnection {
    id: u64,
    sink: PeerEventSink,
    network: Weak<FakeNetwork>,
    inner: Mutex<FakeConnState>,
}

fn fake_sdp(conn: u64, version: u64, kind: &str) -> String {
    format!("v=0\r\no=- {conn} {version} IN IP4 127.0.0.1\r\ns=fake-{kind}\r\nt=0 0\r\n")
}

/// Номер соединения-автора из строки `o=`
fn sdp_origin(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o="))
        .and_then(|origin| origin.split_whitespace().nth(1))
        .and_then(|id| id.parse().ok())
}

impl FakeConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Следующий вызов `op` завершится ошибкой
    pub fn fail_next(&self, op: FakeOp) {
        lock(&self.inner).failures.insert(op);
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.inner).offers_created
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.inner).rollbacks
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.inner).close_calls
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn track_count(&self) -> usize {
        lock(&self.inner).tracks.len()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).candidates.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    pub fn channels(&self) -> Vec<Arc<FakeDataChannel>> {
        lock(&self.inner).channels.clone()
    }

    fn check(&self, op: FakeOp) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(CallError::NegotiationError("connection closed".into()));
        }
        if inner.failures.remove(&op) {
            return Err(CallError::NegotiationError(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    /// Действия «сети» после применения описания пира
    fn on_remote_applied(&self, peer: &Arc<FakeConnection>, kind: SdpType) {
        if kind == SdpType::Offer {
            // каналы пира, ещё не имеющие пары, появляются у нас как удалённые
            for theirs in peer.channels() {
                if theirs.pair().is_some() {
                    continue;
                }
                let ours = Arc::new(FakeDataChannel::new(&theirs.label, self.network.clone()));
                ours.set_pair(peer.id, theirs.id);
                theirs.set_pair(self.id, ours.id);
                lock(&self.inner).channels.push(ours.clone());
                self.sink.emit(PeerEvent::RemoteChannel(ours));
            }
        } else {
            // answer завершает обмен: каналы с парой открываются с обеих сторон
            for ours in self.channels() {
                if ours.is_open() {
                    continue;
                }
                if let Some((peer_id, their_id)) = ours.pair() {
                    if peer_id != peer.id {
                        continue;
                    }
                    ours.open.store(true, Ordering::SeqCst);
                    self.sink.emit(PeerEvent::ChannelOpened(ours.id));
                    if let Some(theirs) = peer.channels().into_iter().find(|c| c.id == their_id) {
                        theirs.open.store(true, Ordering::SeqCst);
                        peer.sink.emit(PeerEvent::ChannelOpened(theirs.id));
                    }
                }
            }
        }

        let peer_tracks: Vec<Arc<dyn MediaTrack>> = lock(&peer.inner).tracks.clone();
        for track in peer_tracks {
            let fresh = lock(&self.inner).announced.insert(track.id().to_string());
            if fresh {
                self.sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id().to_string(),
                    kind: track.kind(),
                    stream_id: format!("fake-remote-{}", peer.id),
                }));
            }
        }
    }
}

#[async_trait]
impl ConnectionTransport for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check(FakeOp::CreateOffer)?;
        let mut inner = lock(&self.inner);
        inner.version += 1;
        inner.offers_created += 1;
        Ok(SessionDescription::offer(fake_sdp(self.id, inner.version, "offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check(FakeOp::CreateAnswer)?;
        let mut inner = lock(&self.inner);
        match &inner.remote {
            Some(desc) if desc.kind == SdpType::Offer => {}
            _ => {
                return Err(CallError::NegotiationError(
                    "create_answer without remote offer".into(),
                ))
            }
        }
        inner.version += 1;
        Ok(SessionDescription::answer(fake_sdp(self.id, inner.version, "answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.check(FakeOp::SetLocal)?;
        let first = {
            let mut inner = lock(&self.inner);
            inner.offer_pending = desc.kind == SdpType::Offer;
            inner.previous_local = inner.local.replace(desc);
            !std::mem::replace(&mut inner.candidate_sent, true)
        };
        if first {
            self.sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{0} 1 udp 2122260223 10.0.0.{0} 5000 typ host",
                    self.id
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.check(FakeOp::SetRemote)?;
        let kind = desc.kind;
        let origin = sdp_origin(&desc.sdp);
        {
            let mut inner = lock(&self.inner);
            if kind == SdpType::Offer && inner.offer_pending {
                return Err(CallError::NegotiationError(
                    "invalid proposed signaling state transition from have-local-offer \
                     applying remote offer"
                        .into(),
                ));
            }
            inner.offer_pending = false;
            inner.remote = Some(desc);
        }

        let peer = origin.and_then(|id| self.network.upgrade().and_then(|net| net.find(id)));
        if let Some(peer) = peer {
            self.on_remote_applied(&peer, kind);
        }
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<()> {
        self.check(FakeOp::SetLocal)?;
        let supported = self.network.upgrade().is_some_and(|net| net.rollback);
        let mut inner = lock(&self.inner);
        if !inner.offer_pending {
            return Err(CallError::NegotiationError(
                "rollback: cannot rollback from stable".into(),
            ));
        }
        if !supported {
            return Err(CallError::NegotiationError(
                "rollback: invalid proposed signaling state transition from have-local-offer \
                 applying local rollback"
                    .into(),
            ));
        }
        inner.local = inner.previous_local.take();
        inner.offer_pending = false;
        inner.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check(FakeOp::AddCandidate)?;
        let mut inner = lock(&self.inner);
        if inner.remote.is_none() {
            return Err(CallError::NegotiationError(
                "remote description not set".into(),
            ));
        }
        inner.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        if lock(&self.inner).closed {
            return Err(CallError::NegotiationError("connection closed".into()));
        }
        lock(&self.inner).tracks.push(track);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.check(FakeOp::CreateChannel)?;
        let channel = Arc::new(FakeDataChannel::new(label, self.network.clone()));
        lock(&self.inner).channels.push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut inner = lock(&self.inner);
            inner.close_calls += 1;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.channels.clone()
        };
        for channel in channels {
            channel.open.store(false, Ordering::SeqCst);
            if let Some(theirs) = channel.peer_channel() {
                if theirs.open.swap(false, Ordering::SeqCst) {
                    if let Some(peer) = channel.peer_connection() {
                        peer.sink.emit(PeerEvent::ChannelClosed(theirs.id));
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct FakeDataChannel {
    id: ChannelId,
    label: String,
    open: AtomicBool,
    pair: Mutex<Option<(u64, ChannelId)>>,
    network: Weak<FakeNetwork>,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    fn new(label: &str, network: Weak<FakeNetwork>) -> Self {
        Self {
            id: next_channel_id(),
            label: label.to_string(),
            open: AtomicBool::new(false),
            pair: Mutex::new(None),
            network,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    fn pair(&self) -> Option<(u64, ChannelId)> {
        *lock(&self.pair)
    }

    fn set_pair(&self, conn: u64, channel: ChannelId) {
        *lock(&self.pair) = Some((conn, channel));
    }

    fn peer_connection(&self) -> Option<Arc<FakeConnection>> {
        let (conn, _) = self.pair()?;
        self.network.upgrade()?.find(conn)
    }

    fn peer_channel(&self) -> Option<Arc<FakeDataChannel>> {
        let (_, channel) = self.pair()?;
        self.peer_connection()?
            .channels()
            .into_iter()
            .find(|c| c.id == channel)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(CallError::ChannelNotReady);
        }
        lock(&self.sent).push(text.to_string());
        if let (Some(peer), Some(theirs)) = (self.peer_connection(), self.peer_channel()) {
            peer.sink.emit(PeerEvent::ChannelMessage {
                channel: theirs.id,
                text: text.to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
