//! Жизненный цикл звонка: инициирование, приём, активный звонок, завершение.
//!
//! Всё вызывается из одного цикла событий (`client`), поэтому блокировок
//! нет; после каждого await состояние проверяется заново, а события
//! соединения от прошлых сессий отбрасываются по номеру сессии.

use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventHub};
use crate::logger::dump_candidate;
use crate::media::{LocalMedia, MediaConstraints, MediaSource, TrackInfo};
use crate::messenger::{ChatHandler, ChatMessage, Messenger};
use crate::peer::negotiation::{AnswerOutcome, NegotiationEngine};
use crate::peer::state::{ExchangeKind, Role, SignalingPhase};
use crate::peer::transport::{
    ConnectionFactory, ConnectionState, PeerEvent, PeerEventSink, SessionEvent, SessionId,
};
use crate::peer::types::{
    IceCandidate, ParticipantId, RemoteTrack, SdpType, SessionDescription, TrackKind,
};
use crate::session::CallSession;
use crate::signaling::{OutboundSignal, SignalingRelay};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    NoCall,
    /// Исходящий звонок, ждём `call:accepted`
    Ringing,
    /// Входящий звонок в обработке
    Incoming,
    Active,
    Ending,
}

/// Предпочтения пользователя; переживают звонки и применяются к новым трекам
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuteState {
    pub audio_muted: bool,
    pub video_on_hold: bool,
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub data_channel_label: String,
    pub constraints: MediaConstraints,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            data_channel_label: "chat".into(),
            constraints: MediaConstraints::default(),
        }
    }
}

/// Всё, что показывает UI
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub remote: Option<ParticipantId>,
    pub phase: Option<SignalingPhase>,
    pub connection: Option<ConnectionState>,
    pub local_tracks: Vec<TrackInfo>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub mute: MuteState,
    pub channel_ready: bool,
    pub transcript: Vec<ChatMessage>,
}

fn warning(hub: &EventHub, message: String) {
    warn!("{message}");
    hub.emit(&CallEvent::Warning { message });
}

pub struct CallManager {
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn ConnectionFactory>,
    media_source: Arc<dyn MediaSource>,
    peer_tx: mpsc::UnboundedSender<SessionEvent>,
    hub: Arc<EventHub>,
    options: CallOptions,
    state: CallState,
    session: Option<CallSession>,
    last_session: SessionId,
    mute: MuteState,
    chat_handler: Option<ChatHandler>,
    /// Пришло до `incoming:call`
    early_candidates: Vec<(ParticipantId, IceCandidate)>,
    early_ring: Option<ParticipantId>,
}

impl CallManager {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn ConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
        peer_tx: mpsc::UnboundedSender<SessionEvent>,
        hub: Arc<EventHub>,
        options: CallOptions,
    ) -> Self {
        Self {
            relay,
            factory,
            media_source,
            peer_tx,
            hub,
            options,
            state: CallState::NoCall,
            session: None,
            last_session: 0,
            mute: MuteState::default(),
            chat_handler: None,
            early_candidates: Vec::new(),
            early_ring: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn mute(&self) -> MuteState {
        self.mute
    }

    pub fn remote(&self) -> Option<&ParticipantId> {
        self.session.as_ref().map(|s| &s.remote)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            info!("Call state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.hub.emit(&CallEvent::StateChanged { state });
        }
    }

    fn apply_mute(&self, media: &LocalMedia) {
        media.set_enabled(TrackKind::Audio, !self.mute.audio_muted);
        media.set_enabled(TrackKind::Video, !self.mute.video_on_hold);
    }

    /// Захват медиа и новая CallSession с данной ролью
    async fn open_session(&mut self, remote: ParticipantId, role: Role) -> Result<CallSession> {
        let media = self.media_source.acquire(self.options.constraints).await?;
        self.apply_mute(&media);

        self.last_session += 1;
        let id = self.last_session;
        let sink = PeerEventSink::new(id, self.peer_tx.clone());
        let connection = match self.factory.connect(sink).await {
            Ok(connection) => connection,
            Err(e) => {
                media.stop_all();
                return Err(e);
            }
        };

        let negotiation =
            NegotiationEngine::new(connection.clone(), self.relay.clone(), remote.clone(), role);
        let mut messenger = Messenger::new(&connection, &self.options.data_channel_label);
        if let Some(handler) = &self.chat_handler {
            messenger.on_receive(handler.clone());
        }
        let mut session = CallSession::new(id, remote, connection, negotiation, messenger, media);

        if let Some(from) = self.early_ring.take() {
            session.remote_rang = from == session.remote;
        }
        let early: Vec<IceCandidate> = std::mem::take(&mut self.early_candidates)
            .into_iter()
            .filter(|(from, _)| *from == session.remote)
            .map(|(_, candidate)| candidate)
            .collect();
        session.adopt_early_candidates(early).await;

        debug!("Opened session {id} with {} as {role:?}", session.remote);
        Ok(session)
    }

    /// Исходящий звонок: невежливая роль, канал открывается сразу,
    /// треки добавляются только после `call:accepted`.
    pub async fn initiate_call(&mut self, remote: ParticipantId) -> Result<()> {
        if self.state != CallState::NoCall || self.session.is_some() {
            return Err(CallError::invalid_state("initiate_call", self.state));
        }
        self.set_state(CallState::Ringing);

        let mut session = match self.open_session(remote.clone(), Role::Impolite).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Call attempt to {remote} aborted: {e}");
                self.set_state(CallState::NoCall);
                return Err(e);
            }
        };

        if let Err(e) = start_outgoing(&mut session).await {
            warn!("Call attempt to {remote} aborted: {e}");
            session.teardown().await;
            self.set_state(CallState::NoCall);
            return Err(e);
        }

        if !self.relay.send(OutboundSignal::CallInitiated { to: remote.clone() }) {
            warn!("call:initiated to {remote} was not acknowledged");
        }
        self.session = Some(session);
        Ok(())
    }

    /// `incoming:call`: вежливая роль и answer. Свои треки вызываемый
    /// добавляет позже, см. [`CallManager::handle_renegotiation_offer`].
    pub async fn handle_incoming_call(
        &mut self,
        from: ParticipantId,
        offer: SessionDescription,
    ) -> Result<()> {
        if self.state != CallState::NoCall || self.session.is_some() {
            return Err(CallError::invalid_state("incoming call", self.state));
        }
        offer.validate(SdpType::Offer)?;
        self.set_state(CallState::Incoming);

        let mut session = match self.open_session(from.clone(), Role::Polite).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Incoming call from {from} aborted: {e}");
                self.set_state(CallState::NoCall);
                return Err(e);
            }
        };

        let failure = match session
            .negotiation
            .receive_offer(offer, ExchangeKind::Call)
            .await
        {
            Ok(AnswerOutcome::Answered { .. }) => None,
            Ok(AnswerOutcome::IgnoredGlare) => Some(CallError::InvalidState(
                "incoming offer was not answered".into(),
            )),
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            warn!("Incoming call from {from} aborted: {e}");
            session.teardown().await;
            self.set_state(CallState::NoCall);
            return Err(e);
        }

        session.messenger.activate();
        self.session = Some(session);
        self.set_state(CallState::Active);
        Ok(())
    }

    /// `call:accepted`: OfferSent → Stable и отложенное добавление треков
    pub async fn acceptance_confirmed(
        &mut self,
        from: ParticipantId,
        answer: SessionDescription,
    ) -> Result<()> {
        if self.state != CallState::Ringing {
            return Err(CallError::invalid_state("call:accepted", self.state));
        }
        let session = session_for(&mut self.session, "call:accepted", &from)?;
        match session.negotiation.receive_answer(answer).await {
            Ok(first_stable) => {
                if first_stable {
                    session.messenger.activate();
                }
            }
            Err(e) if e.aborts_call_attempt() => {
                warn!("Call attempt to {from} aborted: {e}");
                self.end_call().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.set_state(CallState::Active);
        self.send_streams().await;
        Ok(())
    }

    async fn send_streams(&mut self) {
        let attached = match self.session.as_mut() {
            Some(session) => session.attach_tracks().await,
            None => return,
        };
        if let Err(e) = attached {
            warning(&self.hub, format!("Failed to attach local tracks: {e}"));
        }
        self.flush_renegotiation().await;
    }

    /// Запланированный offer, если треки менялись
    async fn flush_renegotiation(&mut self) {
        let result = match self.session.as_mut() {
            Some(session) => session.negotiation.run_scheduled_offer().await,
            None => return,
        };
        if let Err(e) = result {
            warning(&self.hub, format!("Renegotiation offer failed: {e}"));
        }
    }

    /// `peer:nego:needed`. Ошибки согласования не завершают звонок, кроме
    /// glare, из которого соединение не может выйти.
    ///
    /// Вызываемый добавляет свои треки только после ответа на первый такой
    /// offer: звонящий шлёт его сразу после `call:accepted`, и встречный
    /// offer вызываемого в это время привёл бы к glare.
    pub async fn handle_renegotiation_offer(
        &mut self,
        from: ParticipantId,
        offer: SessionDescription,
    ) -> Result<()> {
        if !matches!(self.state, CallState::Ringing | CallState::Active) {
            return Err(CallError::invalid_state("peer:nego:needed", self.state));
        }
        let session = session_for(&mut self.session, "peer:nego:needed", &from)?;
        let answered = match session
            .negotiation
            .receive_offer(offer, ExchangeKind::Renegotiation)
            .await
        {
            Ok(AnswerOutcome::Answered { first_stable }) => {
                if first_stable {
                    session.messenger.activate();
                }
                true
            }
            Ok(AnswerOutcome::IgnoredGlare) => false,
            Err(e) if session.negotiation.is_stalled() => {
                warn!("Ending call with {from}: {e}");
                self.end_call().await;
                return Err(e);
            }
            Err(e) => {
                warning(&self.hub, format!("Renegotiation with {from} failed: {e}"));
                return Ok(());
            }
        };
        let callee_waiting =
            session.negotiation.role() == Role::Polite && !session.tracks_attached();
        if answered && callee_waiting {
            self.send_streams().await;
        } else {
            self.flush_renegotiation().await;
        }
        Ok(())
    }

    /// `peer:nego:final`
    pub async fn handle_renegotiation_answer(
        &mut self,
        from: ParticipantId,
        answer: SessionDescription,
    ) -> Result<()> {
        if self.state != CallState::Active {
            return Err(CallError::invalid_state("peer:nego:final", self.state));
        }
        let session = session_for(&mut self.session, "peer:nego:final", &from)?;
        if let Err(e) = session.negotiation.receive_answer(answer).await {
            warning(&self.hub, format!("Renegotiation answer from {from} rejected: {e}"));
            return Ok(());
        }
        self.flush_renegotiation().await;
        Ok(())
    }

    pub async fn handle_remote_candidate(
        &mut self,
        from: ParticipantId,
        candidate: IceCandidate,
    ) -> Result<()> {
        match self.session.as_mut() {
            Some(session) if session.remote == from => {
                session.negotiation.add_ice_candidate(candidate).await
            }
            Some(session) => {
                debug!("Ignoring candidate from {from}, in a call with {}", session.remote);
                Ok(())
            }
            None => {
                candidate.validate()?;
                // звонок ещё не пришёл
                self.early_candidates.retain(|(id, _)| *id == from);
                self.early_candidates.push((from, candidate));
                Ok(())
            }
        }
    }

    /// `call:initiated` только информирует; повтор в той же сессии это ошибка
    pub fn handle_call_initiated(&mut self, from: ParticipantId) -> Result<()> {
        match self.session.as_mut() {
            Some(session) if session.remote == from => {
                if session.remote_rang {
                    return Err(CallError::InvalidState(format!(
                        "duplicate call:initiated from {from} in session {}",
                        session.id
                    )));
                }
                session.remote_rang = true;
            }
            Some(session) => {
                return Err(CallError::InvalidState(format!(
                    "call:initiated from {from} while in a call with {}",
                    session.remote
                )));
            }
            None => {
                if self.early_ring.as_ref() == Some(&from) {
                    return Err(CallError::InvalidState(format!(
                        "duplicate call:initiated from {from}"
                    )));
                }
                self.early_ring = Some(from.clone());
            }
        }
        self.hub.emit(&CallEvent::RemoteRinging { from });
        Ok(())
    }

    pub fn toggle_audio(&mut self) -> MuteState {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_video(&mut self) -> MuteState {
        self.toggle(TrackKind::Video)
    }

    /// Только флаг `enabled` у треков одного вида, без сигнализации
    fn toggle(&mut self, kind: TrackKind) -> MuteState {
        let off = match kind {
            TrackKind::Audio => {
                self.mute.audio_muted = !self.mute.audio_muted;
                self.mute.audio_muted
            }
            TrackKind::Video => {
                self.mute.video_on_hold = !self.mute.video_on_hold;
                self.mute.video_on_hold
            }
        };
        if let Some(media) = self.session.as_ref().and_then(CallSession::media) {
            media.set_enabled(kind, !off);
        }
        debug!("Local {kind:?} {}", if off { "disabled" } else { "enabled" });
        self.hub.emit(&CallEvent::MuteChanged { mute: self.mute });
        self.mute
    }

    /// Идемпотентно: без сессии ничего не делает. `true` если сессия была.
    pub async fn end_call(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            self.set_state(CallState::NoCall);
            return false;
        };
        let remote = session.remote.clone();
        self.set_state(CallState::Ending);
        session.teardown().await;
        if !self.relay.send(OutboundSignal::CallEnd { to: remote.clone() }) {
            warn!("call:end to {remote} was not acknowledged");
        }
        self.finish_teardown();
        true
    }

    /// `call:end` от текущего собеседника: тот же teardown без ответного call:end
    pub async fn handle_remote_end(&mut self, from: &ParticipantId) -> bool {
        match &self.session {
            Some(session) if session.remote == *from => {}
            _ => {
                debug!("Ignoring call:end from {from}");
                return false;
            }
        }
        self.teardown_local().await
    }

    /// Собеседник покинул комнату
    pub async fn handle_peer_left(&mut self, id: &ParticipantId) -> bool {
        self.early_candidates.retain(|(from, _)| from != id);
        if self.early_ring.as_ref() == Some(id) {
            self.early_ring = None;
        }
        self.handle_remote_end(id).await
    }

    async fn teardown_local(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        self.set_state(CallState::Ending);
        session.teardown().await;
        self.finish_teardown();
        true
    }

    fn finish_teardown(&mut self) {
        self.early_candidates.clear();
        self.early_ring = None;
        self.set_state(CallState::NoCall);
    }

    /// События соединения; чужие сессии отбрасываются
    pub fn on_peer_event(&mut self, event: SessionEvent) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == event.session) else {
            debug!("Dropping {:?} from stale session {}", event.event, event.session);
            return;
        };
        match event.event {
            PeerEvent::LocalCandidate(candidate) => {
                dump_candidate("LOCAL", &candidate);
                if !session.negotiation.send_local_candidate(candidate) {
                    debug!("Local candidate was not delivered");
                }
            }
            PeerEvent::StateChanged(state) => {
                session.connection_state = state;
                info!("Connection with {} is {state:?}", session.remote);
                self.hub.emit(&CallEvent::ConnectionChanged { state });
                if state == ConnectionState::Failed {
                    let stats = session.negotiation.local_candidate_stats();
                    let mut message = format!(
                        "Connection with {} failed, local candidates: {stats}",
                        session.remote
                    );
                    if stats.relay == 0 {
                        message.push_str("; no TURN relay candidate, NAT traversal may fail");
                    }
                    warning(&self.hub, message);
                }
            }
            PeerEvent::RemoteChannel(channel) => session.messenger.adopt_remote(channel),
            PeerEvent::ChannelOpened(id) => session.messenger.on_channel_open(id),
            PeerEvent::ChannelClosed(id) => session.messenger.on_channel_closed(id),
            PeerEvent::ChannelMessage { channel, text } => {
                if let Some(message) = session.messenger.on_channel_message(channel, text) {
                    self.hub.emit(&CallEvent::Chat { message });
                }
            }
            PeerEvent::RemoteTrack(track) => {
                if session.add_remote_track(track.clone()) {
                    info!("Remote {:?} track {} from {}", track.kind, track.id, session.remote);
                    self.hub.emit(&CallEvent::RemoteTrack { track });
                }
            }
        }
    }

    pub async fn send_chat(&mut self, text: &str) -> Result<ChatMessage> {
        if text.trim().is_empty() {
            return Err(CallError::EmptyMessage);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::ChannelNotReady);
        };
        let message = session.messenger.send(text).await?;
        self.hub.emit(&CallEvent::Chat {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Один обработчик входящего чата, переносится на следующие сессии
    pub fn on_receive(&mut self, handler: ChatHandler) {
        if let Some(session) = self.session.as_mut() {
            session.messenger.on_receive(handler.clone());
        }
        self.chat_handler = Some(handler);
    }

    pub fn clear_receive(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.messenger.clear_receive();
        }
        self.chat_handler = None;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let session = self.session.as_ref();
        CallSnapshot {
            state: self.state,
            remote: session.map(|s| s.remote.clone()),
            phase: session.map(|s| s.negotiation.phase()),
            connection: session.map(|s| s.connection_state),
            local_tracks: session.map(CallSession::local_tracks).unwrap_or_default(),
            remote_tracks: session
                .map(|s| s.remote_tracks().to_vec())
                .unwrap_or_default(),
            mute: self.mute,
            channel_ready: session.is_some_and(|s| s.messenger.is_ready()),
            transcript: session
                .map(|s| s.messenger.transcript().to_vec())
                .unwrap_or_default(),
        }
    }
}

async fn start_outgoing(session: &mut CallSession) -> Result<()> {
    session.messenger.open_channel().await?;
    session.negotiation.create_offer().await
}

fn session_for<'a>(
    session: &'a mut Option<CallSession>,
    op: &str,
    from: &ParticipantId,
) -> Result<&'a mut CallSession> {
    match session.as_ref().map(|s| &s.remote) {
        Some(remote) if remote == from => {}
        Some(remote) => {
            return Err(CallError::InvalidState(format!(
                "{op} from {from} while in a call with {remote}"
            )))
        }
        None => {
            return Err(CallError::InvalidState(format!(
                "{op} from {from} without a call"
            )))
        }
    }
    session
        .as_mut()
        .ok_or_else(|| CallError::InvalidState(format!("{op} from {from} without a call")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use crate::mock::{FakeMediaSource, FakeNetwork, RecordingRelay};
    use std::sync::Mutex;

    struct Rig {
        manager: CallManager,
        relay: Arc<RecordingRelay>,
        network: Arc<FakeNetwork>,
        media: Arc<FakeMediaSource>,
        events: Arc<Mutex<Vec<CallEvent>>>,
        peer_rx: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn rig() -> Rig {
        let relay = Arc::new(RecordingRelay::new("me"));
        let network = FakeNetwork::new();
        let media = FakeMediaSource::new();
        let hub = EventHub::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        hub.subscribe(Arc::new(move |e: &CallEvent| sink.lock().unwrap().push(e.clone())));
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(
            relay.clone(),
            network.factory(),
            media.clone(),
            tx,
            hub,
            CallOptions::default(),
        );
        Rig {
            manager,
            relay,
            network,
            media,
            events,
            peer_rx: rx,
        }
    }

    fn peer() -> ParticipantId {
        ParticipantId::new("peer")
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\no=- 900 1 IN IP4 127.0.0.1\r\ns=-\r\n")
    }

    fn remote_answer() -> SessionDescription {
        SessionDescription::answer("v=0\r\no=- 900 2 IN IP4 127.0.0.1\r\ns=-\r\n")
    }

    fn count_sent(relay: &RecordingRelay, pred: impl Fn(&OutboundSignal) -> bool) -> usize {
        relay.sent().iter().filter(|s| pred(s)).count()
    }

    #[tokio::test]
    async fn test_initiate_call_defers_tracks() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        assert_eq!(r.manager.state(), CallState::Ringing);

        let sent = r.relay.sent();
        assert!(matches!(&sent[0], OutboundSignal::UserCall { .. }));
        assert!(matches!(&sent[1], OutboundSignal::CallInitiated { to } if *to == peer()));

        let conn = r.network.connection(0).unwrap();
        assert_eq!(conn.channels().len(), 1);
        assert_eq!(conn.track_count(), 0);
        assert_eq!(
            r.manager.session().unwrap().negotiation.role(),
            Role::Impolite
        );
    }

    #[tokio::test]
    async fn test_media_failure_aborts_attempt() {
        let mut r = rig();
        r.media.set_failing(true);
        let err = r.manager.initiate_call(peer()).await.unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert_eq!(r.manager.state(), CallState::NoCall);
        assert!(r.relay.sent().is_empty());
        assert!(r.network.connection(0).is_none());
    }

    #[tokio::test]
    async fn test_initiate_twice_is_invalid_state() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        let err = r.manager.initiate_call(peer()).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(r.network.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_acceptance_attaches_pending_tracks() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        r.relay.take_sent();

        r.manager
            .acceptance_confirmed(peer(), remote_answer())
            .await
            .unwrap();
        assert_eq!(r.manager.state(), CallState::Active);
        assert_eq!(r.network.connection(0).unwrap().track_count(), 2);
        // два трека, одно пересогласование
        let sent = r.relay.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], OutboundSignal::NegoNeeded { .. }));
    }

    #[tokio::test]
    async fn test_acceptance_from_stranger_rejected() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        let err = r
            .manager
            .acceptance_confirmed(ParticipantId::new("stranger"), remote_answer())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(r.manager.state(), CallState::Ringing);
    }

    #[tokio::test]
    async fn test_incoming_call_answers_without_own_offer() {
        let mut r = rig();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        assert_eq!(r.manager.state(), CallState::Active);

        let sent = r.relay.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], OutboundSignal::CallAccepted { to, .. } if *to == peer()));
        let session = r.manager.session().unwrap();
        assert_eq!(session.negotiation.role(), Role::Polite);
        assert_eq!(session.negotiation.phase(), SignalingPhase::Stable);
        assert!(!session.tracks_attached());
    }

    #[tokio::test]
    async fn test_callee_sends_streams_after_answering_caller_tracks() {
        let mut r = rig();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        r.relay.take_sent();

        r.manager
            .handle_renegotiation_offer(peer(), remote_offer())
            .await
            .unwrap();
        let sent = r.relay.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], OutboundSignal::NegoDone { .. }));
        assert!(matches!(&sent[1], OutboundSignal::NegoNeeded { .. }));
        assert_eq!(r.network.connection(0).unwrap().track_count(), 2);

        // треки добавляются один раз
        r.manager
            .handle_renegotiation_answer(peer(), remote_answer())
            .await
            .unwrap();
        r.manager
            .handle_renegotiation_offer(peer(), remote_offer())
            .await
            .unwrap();
        let sent = r.relay.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], OutboundSignal::NegoDone { .. }));
        assert_eq!(r.network.connection(0).unwrap().track_count(), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_glare_ends_call() {
        let mut r = rig();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        r.manager
            .handle_renegotiation_offer(peer(), remote_offer())
            .await
            .unwrap();
        assert_eq!(
            r.manager.snapshot().phase,
            Some(SignalingPhase::OfferSent)
        );

        // встречный offer, а откатить свой соединение не может
        let err = r
            .manager
            .handle_renegotiation_offer(peer(), remote_offer())
            .await
            .unwrap_err();
        assert!(err.is_negotiation_error());
        assert_eq!(r.manager.state(), CallState::NoCall);
        assert!(r.manager.session().is_none());
        assert_eq!(
            count_sent(&r.relay, |s| matches!(s, OutboundSignal::CallEnd { .. })),
            1
        );
        assert!(r.network.connection(0).unwrap().is_closed());
        assert!(!r.manager.end_call().await);
    }

    #[tokio::test]
    async fn test_malformed_incoming_offer_keeps_nocall() {
        let mut r = rig();
        let err = r
            .manager
            .handle_incoming_call(peer(), SessionDescription::offer("garbage"))
            .await
            .unwrap_err();
        assert!(err.is_negotiation_error());
        assert_eq!(r.manager.state(), CallState::NoCall);
        assert!(r.media.tracks().is_empty());
    }

    #[tokio::test]
    async fn test_toggles_touch_only_their_track() {
        let mut r = rig();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        let before = r.relay.sent().len();
        let tracks = r.media.tracks();
        let audio = tracks.iter().find(|t| t.kind() == TrackKind::Audio).unwrap();
        let video = tracks.iter().find(|t| t.kind() == TrackKind::Video).unwrap();

        let mute = r.manager.toggle_audio();
        assert!(mute.audio_muted && !mute.video_on_hold);
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());

        r.manager.toggle_video();
        r.manager.toggle_audio();
        assert!(audio.is_enabled());
        assert!(!video.is_enabled());
        assert_eq!(r.relay.sent().len(), before);
    }

    #[tokio::test]
    async fn test_mute_persists_into_next_call() {
        let mut r = rig();
        r.manager.toggle_audio();
        r.manager.initiate_call(peer()).await.unwrap();
        let audio = r
            .media
            .tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .unwrap();
        assert!(!audio.is_enabled());
        assert!(r.manager.snapshot().mute.audio_muted);
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let mut r = rig();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        assert!(r.manager.end_call().await);
        assert!(!r.manager.end_call().await);
        assert!(!r.manager.end_call().await);

        assert_eq!(r.manager.state(), CallState::NoCall);
        assert_eq!(
            count_sent(&r.relay, |s| matches!(s, OutboundSignal::CallEnd { .. })),
            1
        );
        for track in r.media.tracks() {
            assert_eq!(track.stop_calls(), 1);
        }
        let conn = r.network.connection(0).unwrap();
        assert_eq!(conn.close_calls(), 1);
        assert!(r.manager.session().is_none());
    }

    #[tokio::test]
    async fn test_end_call_while_ringing() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        assert_eq!(
            r.manager.snapshot().phase,
            Some(SignalingPhase::OfferSent)
        );

        assert!(r.manager.end_call().await);
        assert!(!r.manager.end_call().await);
        assert_eq!(r.manager.state(), CallState::NoCall);
        assert_eq!(
            count_sent(&r.relay, |s| matches!(s, OutboundSignal::CallEnd { .. })),
            1
        );
        for track in r.media.tracks() {
            assert_eq!(track.stop_calls(), 1);
        }
        assert_eq!(r.network.connection(0).unwrap().close_calls(), 1);

        // answer на брошенный offer уже некому применять
        assert!(r
            .manager
            .acceptance_confirmed(peer(), remote_answer())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_incoming_call_failing_midway_leaves_nothing_to_end() {
        let mut r = rig();
        r.media.set_failing(true);
        let err = r
            .manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));

        let states: Vec<CallState> = r
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![CallState::Incoming, CallState::NoCall]);

        assert!(!r.manager.end_call().await);
        assert!(r.relay.sent().is_empty());
        assert!(r.network.connections().is_empty());
    }

    #[tokio::test]
    async fn test_end_from_nocall_is_noop() {
        let mut r = rig();
        assert!(!r.manager.end_call().await);
        assert!(r.relay.sent().is_empty());
        assert!(r.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_end_does_not_notify_back() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        assert!(
            !r.manager
                .handle_remote_end(&ParticipantId::new("stranger"))
                .await
        );
        assert_eq!(r.manager.state(), CallState::Ringing);

        assert!(r.manager.handle_remote_end(&peer()).await);
        assert_eq!(r.manager.state(), CallState::NoCall);
        assert_eq!(
            count_sent(&r.relay, |s| matches!(s, OutboundSignal::CallEnd { .. })),
            0
        );
        assert!(r.network.connection(0).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_second_call_initiated_is_invalid_state() {
        let mut r = rig();
        r.manager.handle_call_initiated(peer()).unwrap();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        let err = r.manager.handle_call_initiated(peer()).unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(r.manager.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_early_candidates_survive_until_call() {
        let mut r = rig();
        let candidate = IceCandidate {
            candidate: "candidate:7 1 udp 2122260223 10.0.0.7 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        r.manager
            .handle_remote_candidate(peer(), candidate.clone())
            .await
            .unwrap();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        assert_eq!(
            r.network.connection(0).unwrap().applied_candidates(),
            vec![candidate]
        );
    }

    #[tokio::test]
    async fn test_stale_session_events_dropped() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        let first = r.manager.session().unwrap().id;
        r.manager.end_call().await;
        r.manager.initiate_call(peer()).await.unwrap();

        r.manager.on_peer_event(SessionEvent {
            session: first,
            event: PeerEvent::StateChanged(ConnectionState::Failed),
        });
        assert_eq!(
            r.manager.snapshot().connection,
            Some(ConnectionState::New)
        );

        // события живой сессии доходят; кандидат уходит через relay
        while let Ok(event) = r.peer_rx.try_recv() {
            r.manager.on_peer_event(event);
        }
        assert!(count_sent(&r.relay, |s| matches!(s, OutboundSignal::IceCandidate { .. })) >= 1);
    }

    #[tokio::test]
    async fn test_failed_connection_warning_lists_local_candidates() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        while let Ok(event) = r.peer_rx.try_recv() {
            r.manager.on_peer_event(event);
        }
        let session = r.manager.session().unwrap().id;
        r.manager.on_peer_event(SessionEvent {
            session,
            event: PeerEvent::StateChanged(ConnectionState::Failed),
        });

        let events = r.events.lock().unwrap();
        let message = events
            .iter()
            .find_map(|e| match e {
                CallEvent::Warning { message } => Some(message.clone()),
                _ => None,
            })
            .unwrap();
        assert!(message.contains("1 host, 0 srflx, 0 relay"), "{message}");
        assert!(message.contains("no TURN relay candidate"));
    }

    #[tokio::test]
    async fn test_malformed_acceptance_aborts_attempt() {
        let mut r = rig();
        r.manager.initiate_call(peer()).await.unwrap();
        let err = r
            .manager
            .acceptance_confirmed(peer(), SessionDescription::answer("garbage"))
            .await
            .unwrap_err();
        assert!(err.aborts_call_attempt());
        assert_eq!(r.manager.state(), CallState::NoCall);
        assert_eq!(
            count_sent(&r.relay, |s| matches!(s, OutboundSignal::CallEnd { .. })),
            1
        );
        assert!(r.network.connection(0).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_renegotiation_failure_is_warning() {
        let mut r = rig();
        r.manager
            .handle_incoming_call(peer(), remote_offer())
            .await
            .unwrap();
        r.manager
            .handle_renegotiation_offer(peer(), SessionDescription::offer("garbage"))
            .await
            .unwrap();
        assert_eq!(r.manager.state(), CallState::Active);
        assert!(r
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, CallEvent::Warning { .. })));
    }

    #[tokio::test]
    async fn test_chat_without_call() {
        let mut r = rig();
        assert!(matches!(
            r.manager.send_chat("hi").await,
            Err(CallError::ChannelNotReady)
        ));
        assert!(matches!(
            r.manager.send_chat("  ").await,
            Err(CallError::EmptyMessage)
        ));
    }
}
