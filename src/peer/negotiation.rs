//! Движок согласования: offer/answer и ICE поверх одного соединения,
//! плюс разрешение glare по ролям polite/impolite.

use crate::error::{CallError, Result};
use crate::peer::ice::{CandidateStats, PendingCandidates};
use crate::peer::state::{ExchangeKind, NegotiationState, Role, SignalingPhase};
use crate::peer::transport::ConnectionTransport;
use crate::peer::types::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use crate::signaling::{OutboundSignal, SignalingRelay};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Итог обработки входящего offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Answer создан и отправлен; `first_stable` при первом Stable сессии
    Answered { first_stable: bool },
    /// Невежливая сторона в glare оставила свой offer
    IgnoredGlare,
}

pub struct NegotiationEngine {
    connection: Arc<dyn ConnectionTransport>,
    relay: Arc<dyn SignalingRelay>,
    remote: ParticipantId,
    state: NegotiationState,
    pending: PendingCandidates,
    local_stats: CandidateStats,
    closed: bool,
    /// Откат не удался: соединение осталось со своим offer
    stalled: bool,
}

impl NegotiationEngine {
    pub fn new(
        connection: Arc<dyn ConnectionTransport>,
        relay: Arc<dyn SignalingRelay>,
        remote: ParticipantId,
        role: Role,
    ) -> Self {
        Self {
            connection,
            relay,
            remote,
            state: NegotiationState::new(role),
            pending: PendingCandidates::default(),
            local_stats: CandidateStats::default(),
            closed: false,
            stalled: false,
        }
    }

    pub fn phase(&self) -> SignalingPhase {
        self.state.phase
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn local_candidate_stats(&self) -> CandidateStats {
        self.local_stats
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.closed {
            return Err(CallError::InvalidState(format!(
                "{op}: negotiation already closed"
            )));
        }
        if self.stalled {
            return Err(CallError::InvalidState(format!(
                "{op}: negotiation stalled after a failed rollback"
            )));
        }
        Ok(())
    }

    /// Glare не разрешён: вежливая сторона не смогла откатить свой offer,
    /// а невежливая чужой не примет. Дальше только новое соединение.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Создаёт offer, ставит его локально и отправляет удалённой стороне.
    /// До первого Stable уходит как `user:call`, дальше как `peer:nego:needed`.
    pub async fn create_offer(&mut self) -> Result<()> {
        self.ensure_open("create_offer")?;
        if !self.state.can_create_offer() {
            return Err(CallError::invalid_state("create_offer", self.state.phase));
        }

        let generation = self.state.offer_generation + 1;
        let offer = self.connection.create_offer().await?;

        // состояние могло измениться за время ожидания
        self.ensure_open("create_offer")?;
        if !self.state.can_create_offer() {
            debug!("Discarding offer #{generation}: phase is now {:?}", self.state.phase);
            return Err(CallError::invalid_state("create_offer", self.state.phase));
        }

        self.connection.set_local_description(offer.clone()).await?;

        self.state.offer_generation = generation;
        self.state.phase_before_offer = match self.state.phase {
            SignalingPhase::Renegotiating => SignalingPhase::Stable,
            phase => phase,
        };
        self.state.phase = SignalingPhase::OfferSent;
        self.state.renegotiation_pending = false;

        let signal = if self.state.established {
            OutboundSignal::NegoNeeded {
                offer,
                to: self.remote.clone(),
            }
        } else {
            OutboundSignal::UserCall {
                to: self.remote.clone(),
                offer,
            }
        };
        info!("Sending offer #{generation} to {}", self.remote);
        if !self.relay.send(signal) {
            warn!("Offer #{generation} was not acknowledged by the relay");
        }
        Ok(())
    }

    /// Применяет удалённый offer и отвечает на него. При glare вежливая
    /// сторона откатывает свой offer, невежливая игнорирует чужой.
    pub async fn receive_offer(
        &mut self,
        offer: SessionDescription,
        kind: ExchangeKind,
    ) -> Result<AnswerOutcome> {
        offer.validate(SdpType::Offer)?;
        self.ensure_open("receive_offer")?;

        match self.state.phase {
            SignalingPhase::OfferReceived => {
                return Err(CallError::invalid_state("receive_offer", self.state.phase));
            }
            SignalingPhase::OfferSent => match self.state.role {
                Role::Impolite => {
                    info!(
                        "Glare with {}: keeping own offer #{}",
                        self.remote, self.state.offer_generation
                    );
                    return Ok(AnswerOutcome::IgnoredGlare);
                }
                Role::Polite => {
                    info!(
                        "Glare with {}: rolling back own offer #{}",
                        self.remote, self.state.offer_generation
                    );
                    let rolled_back = self.connection.rollback_local_description().await;
                    self.state.phase = self.state.phase_before_offer;
                    if let Err(e) = rolled_back {
                        warn!("Glare with {} cannot be resolved: {e}", self.remote);
                        self.state.renegotiation_pending = false;
                        self.stalled = true;
                        return Err(e);
                    }
                    // откатанные изменения треков надо предложить заново
                    self.state.renegotiation_pending = true;
                }
            },
            _ => {}
        }

        let before = self.state.phase;
        self.connection.set_remote_description(offer).await?;
        self.state.phase = SignalingPhase::OfferReceived;
        self.state.remote_description_set = true;
        self.flush_pending_candidates().await;

        let answer = match self.make_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.state.phase = before;
                return Err(e);
            }
        };
        let first_stable = self.mark_stable();

        let signal = match kind {
            ExchangeKind::Call => OutboundSignal::CallAccepted {
                to: self.remote.clone(),
                ans: answer,
            },
            ExchangeKind::Renegotiation => OutboundSignal::NegoDone {
                to: self.remote.clone(),
                ans: answer,
            },
        };
        if !self.relay.send(signal) {
            warn!("Answer to {} was not acknowledged by the relay", self.remote);
        }
        Ok(AnswerOutcome::Answered { first_stable })
    }

    async fn make_answer(&mut self) -> Result<SessionDescription> {
        let answer = self.connection.create_answer().await?;
        self.ensure_open("receive_offer")?;
        self.connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// OfferSent → Stable. Возвращает `true` при первом Stable.
    pub async fn receive_answer(&mut self, answer: SessionDescription) -> Result<bool> {
        answer.validate(SdpType::Answer)?;
        self.ensure_open("receive_answer")?;
        if self.state.phase != SignalingPhase::OfferSent {
            return Err(CallError::invalid_state("receive_answer", self.state.phase));
        }

        self.connection.set_remote_description(answer).await?;
        self.state.remote_description_set = true;
        self.flush_pending_candidates().await;
        Ok(self.mark_stable())
    }

    fn mark_stable(&mut self) -> bool {
        self.state.phase = if self.state.renegotiation_pending {
            SignalingPhase::Renegotiating
        } else {
            SignalingPhase::Stable
        };
        let first = !self.state.established;
        self.state.established = true;
        debug!("Negotiation with {} is {:?}", self.remote, self.state.phase);
        first
    }

    /// Кандидаты до remote description копятся и применяются позже
    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        candidate.validate()?;
        self.ensure_open("add_ice_candidate")?;
        if !self.state.remote_description_set {
            self.pending.push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    /// Применяет все отложенные кандидаты после установки remote description
    async fn flush_pending_candidates(&mut self) {
        let candidates = self.pending.drain();
        if candidates.is_empty() {
            return;
        }
        debug!("Applying {} pending candidates", candidates.len());
        for candidate in candidates {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Failed to apply pending candidate: {e}");
            }
        }
    }

    /// Trickle: отправка собственного кандидата удалённой стороне
    pub fn send_local_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.closed {
            return false;
        }
        self.local_stats.record(&candidate);
        self.relay.send(OutboundSignal::IceCandidate {
            to: self.remote.clone(),
            candidate,
        })
    }

    /// Набор исходящих треков изменился. Несколько изменений до отправки
    /// offer сливаются в один.
    pub fn tracks_changed(&mut self) {
        if self.closed || self.state.phase == SignalingPhase::Idle {
            return;
        }
        self.state.renegotiation_pending = true;
        if self.state.phase == SignalingPhase::Stable {
            self.state.phase = SignalingPhase::Renegotiating;
        }
    }

    pub fn has_scheduled_offer(&self) -> bool {
        !self.closed && !self.stalled && self.state.renegotiation_pending && self.state.is_stable()
    }

    /// Отправляет запланированный offer, если он есть. При ошибке остаётся
    /// прежний Stable, повтора нет.
    pub async fn run_scheduled_offer(&mut self) -> Result<bool> {
        if !self.has_scheduled_offer() {
            return Ok(false);
        }
        match self.create_offer().await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.state.renegotiation_pending = false;
                if self.state.phase == SignalingPhase::Renegotiating {
                    self.state.phase = SignalingPhase::Stable;
                }
                Err(e)
            }
        }
    }

    /// Дальнейшие результаты согласования отбрасываются
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending.clear();
            debug!(
                "Negotiation with {} closed after {} offers, {} local candidates",
                self.remote,
                self.state.offer_generation,
                self.local_stats.total()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeNetwork, FakeOp, FakeTrack, RecordingRelay};
    use crate::peer::transport::{ConnectionFactory, PeerEventSink};
    use crate::peer::types::TrackKind;
    use tokio::sync::mpsc;

    struct Rig {
        engine: NegotiationEngine,
        relay: Arc<RecordingRelay>,
        network: Arc<FakeNetwork>,
        _rx: mpsc::UnboundedReceiver<crate::peer::transport::SessionEvent>,
    }

    async fn rig(role: Role) -> Rig {
        rig_on(FakeNetwork::new(), role).await
    }

    async fn rig_on(network: Arc<FakeNetwork>, role: Role) -> Rig {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = network
            .factory()
            .connect(PeerEventSink::new(1, tx))
            .await
            .unwrap();
        let relay = Arc::new(RecordingRelay::new("local"));
        let engine = NegotiationEngine::new(
            conn,
            relay.clone(),
            ParticipantId::new("remote"),
            role,
        );
        Rig {
            engine,
            relay,
            network,
            _rx: rx,
        }
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\no=- 900 1 IN IP4 127.0.0.1\r\ns=-\r\n")
    }

    fn remote_answer() -> SessionDescription {
        SessionDescription::answer("v=0\r\no=- 900 2 IN IP4 127.0.0.1\r\ns=-\r\n")
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_initial_offer_goes_out_as_user_call() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        assert_eq!(r.engine.phase(), SignalingPhase::OfferSent);
        let sent = r.relay.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], OutboundSignal::UserCall { to, .. } if to.as_str() == "remote"));
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_invalid_state() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        let err = r.engine.create_offer().await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(r.engine.state().offer_generation, 1);
        assert_eq!(r.network.connection(0).unwrap().offers_created(), 1);
    }

    #[tokio::test]
    async fn test_answer_reaches_stable() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        assert!(r.engine.receive_answer(remote_answer()).await.unwrap());
        assert_eq!(r.engine.phase(), SignalingPhase::Stable);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_invalid_state() {
        let mut r = rig(Role::Impolite).await;
        let err = r.engine.receive_answer(remote_answer()).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(r.engine.phase(), SignalingPhase::Idle);
    }

    #[tokio::test]
    async fn test_malformed_answer_leaves_state_unchanged() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        let err = r
            .engine
            .receive_answer(SessionDescription::answer("nonsense"))
            .await
            .unwrap_err();
        assert!(err.is_negotiation_error());
        assert_eq!(r.engine.phase(), SignalingPhase::OfferSent);
        assert!(r.network.connection(0).unwrap().remote_description().is_none());
    }

    #[tokio::test]
    async fn test_receive_offer_answers_with_call_accepted() {
        let mut r = rig(Role::Polite).await;
        let outcome = r
            .engine
            .receive_offer(remote_offer(), ExchangeKind::Call)
            .await
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::Answered { first_stable: true });
        assert_eq!(r.engine.phase(), SignalingPhase::Stable);
        assert!(matches!(
            r.relay.sent().last(),
            Some(OutboundSignal::CallAccepted { .. })
        ));
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered_then_flushed() {
        let mut r = rig(Role::Polite).await;
        r.engine.add_ice_candidate(candidate(1)).await.unwrap();
        r.engine.add_ice_candidate(candidate(2)).await.unwrap();
        assert_eq!(r.engine.pending_candidates(), 2);
        let conn = r.network.connection(0).unwrap();
        assert!(conn.applied_candidates().is_empty());

        r.engine
            .receive_offer(remote_offer(), ExchangeKind::Call)
            .await
            .unwrap();
        assert_eq!(r.engine.pending_candidates(), 0);
        assert_eq!(conn.applied_candidates(), vec![candidate(1), candidate(2)]);

        r.engine.add_ice_candidate(candidate(3)).await.unwrap();
        assert_eq!(conn.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_candidate_rejected() {
        let mut r = rig(Role::Polite).await;
        let mut bad = candidate(1);
        bad.candidate = "garbage".into();
        assert!(r
            .engine
            .add_ice_candidate(bad)
            .await
            .unwrap_err()
            .is_negotiation_error());
        assert_eq!(r.engine.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_glare_polite_yields() {
        let mut r = rig_on(FakeNetwork::with_rollback(), Role::Polite).await;
        r.engine
            .receive_offer(remote_offer(), ExchangeKind::Call)
            .await
            .unwrap();
        r.engine.tracks_changed();
        assert!(r.engine.run_scheduled_offer().await.unwrap());
        assert_eq!(r.engine.phase(), SignalingPhase::OfferSent);

        let outcome = r
            .engine
            .receive_offer(remote_offer(), ExchangeKind::Renegotiation)
            .await
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::Answered { first_stable: false });
        assert_eq!(r.network.connection(0).unwrap().rollbacks(), 1);
        assert!(matches!(
            r.relay.sent().last(),
            Some(OutboundSignal::NegoDone { .. })
        ));
        // свой откатанный offer будет предложен заново
        assert_eq!(r.engine.phase(), SignalingPhase::Renegotiating);
        assert!(r.engine.has_scheduled_offer());
    }

    #[tokio::test]
    async fn test_failed_rollback_stalls_instead_of_hanging() {
        let mut r = rig(Role::Polite).await;
        r.engine
            .receive_offer(remote_offer(), ExchangeKind::Call)
            .await
            .unwrap();
        r.engine.tracks_changed();
        assert!(r.engine.run_scheduled_offer().await.unwrap());
        let before = r.relay.sent().len();

        let err = r
            .engine
            .receive_offer(remote_offer(), ExchangeKind::Renegotiation)
            .await
            .unwrap_err();
        assert!(err.is_negotiation_error());
        assert!(r.engine.is_stalled());
        assert_eq!(r.engine.phase(), SignalingPhase::Stable);
        assert!(!r.engine.has_scheduled_offer());
        assert!(matches!(
            r.engine.create_offer().await,
            Err(CallError::InvalidState(_))
        ));
        assert_eq!(r.relay.sent().len(), before);
        assert_eq!(r.network.connection(0).unwrap().rollbacks(), 0);
    }

    struct Pair {
        impolite: NegotiationEngine,
        polite: NegotiationEngine,
        impolite_relay: Arc<RecordingRelay>,
        polite_relay: Arc<RecordingRelay>,
        network: Arc<FakeNetwork>,
        _rx: mpsc::UnboundedReceiver<crate::peer::transport::SessionEvent>,
    }

    /// Два движка на одной сети, уже прошедшие первый обмен
    async fn established_pair(network: Arc<FakeNetwork>) -> Pair {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = network.factory();
        let a = factory.connect(PeerEventSink::new(1, tx.clone())).await.unwrap();
        let b = factory.connect(PeerEventSink::new(2, tx)).await.unwrap();
        let impolite_relay = Arc::new(RecordingRelay::new("a"));
        let polite_relay = Arc::new(RecordingRelay::new("b"));
        let mut pair = Pair {
            impolite: NegotiationEngine::new(
                a,
                impolite_relay.clone(),
                ParticipantId::new("b"),
                Role::Impolite,
            ),
            polite: NegotiationEngine::new(
                b,
                polite_relay.clone(),
                ParticipantId::new("a"),
                Role::Polite,
            ),
            impolite_relay,
            polite_relay,
            network,
            _rx: rx,
        };
        pair.impolite.create_offer().await.unwrap();
        let offer = last_offer(&pair.impolite_relay);
        pair.polite
            .receive_offer(offer, ExchangeKind::Call)
            .await
            .unwrap();
        let answer = last_answer(&pair.polite_relay);
        pair.impolite.receive_answer(answer).await.unwrap();
        pair
    }

    fn last_offer(relay: &RecordingRelay) -> SessionDescription {
        relay
            .take_sent()
            .into_iter()
            .rev()
            .find_map(|s| match s {
                OutboundSignal::UserCall { offer, .. } => Some(offer),
                OutboundSignal::NegoNeeded { offer, .. } => Some(offer),
                _ => None,
            })
            .expect("no offer sent")
    }

    fn last_answer(relay: &RecordingRelay) -> SessionDescription {
        relay
            .take_sent()
            .into_iter()
            .rev()
            .find_map(|s| match s {
                OutboundSignal::CallAccepted { ans, .. } => Some(ans),
                OutboundSignal::NegoDone { ans, .. } => Some(ans),
                _ => None,
            })
            .expect("no answer sent")
    }

    #[tokio::test]
    async fn test_concurrent_offers_converge_in_either_order() {
        for polite_offer_first in [true, false] {
            let mut p = established_pair(FakeNetwork::with_rollback()).await;
            p.impolite.tracks_changed();
            p.polite.tracks_changed();
            assert!(p.impolite.run_scheduled_offer().await.unwrap());
            assert!(p.polite.run_scheduled_offer().await.unwrap());
            let from_impolite = last_offer(&p.impolite_relay);
            let from_polite = last_offer(&p.polite_relay);

            let (ignored, answered) = if polite_offer_first {
                let ignored = p
                    .impolite
                    .receive_offer(from_polite, ExchangeKind::Renegotiation)
                    .await
                    .unwrap();
                let answered = p
                    .polite
                    .receive_offer(from_impolite, ExchangeKind::Renegotiation)
                    .await
                    .unwrap();
                (ignored, answered)
            } else {
                let answered = p
                    .polite
                    .receive_offer(from_impolite, ExchangeKind::Renegotiation)
                    .await
                    .unwrap();
                let ignored = p
                    .impolite
                    .receive_offer(from_polite, ExchangeKind::Renegotiation)
                    .await
                    .unwrap();
                (ignored, answered)
            };
            assert_eq!(ignored, AnswerOutcome::IgnoredGlare);
            assert_eq!(answered, AnswerOutcome::Answered { first_stable: false });
            assert!(p.impolite_relay.sent().is_empty());

            let answer = last_answer(&p.polite_relay);
            assert!(!p.impolite.receive_answer(answer).await.unwrap());
            assert_eq!(p.impolite.phase(), SignalingPhase::Stable);

            // вежливая сторона повторяет свой откатанный offer
            assert!(p.polite.run_scheduled_offer().await.unwrap());
            let offer = last_offer(&p.polite_relay);
            p.impolite
                .receive_offer(offer, ExchangeKind::Renegotiation)
                .await
                .unwrap();
            let answer = last_answer(&p.impolite_relay);
            p.polite.receive_answer(answer).await.unwrap();

            assert_eq!(p.impolite.phase(), SignalingPhase::Stable);
            assert_eq!(p.polite.phase(), SignalingPhase::Stable);
            assert_eq!(p.network.connection(0).unwrap().rollbacks(), 0);
            assert_eq!(p.network.connection(1).unwrap().rollbacks(), 1);
        }
    }

    #[tokio::test]
    async fn test_glare_without_rollback_stalls_polite_side() {
        let mut p = established_pair(FakeNetwork::new()).await;
        p.impolite.tracks_changed();
        p.polite.tracks_changed();
        p.impolite.run_scheduled_offer().await.unwrap();
        p.polite.run_scheduled_offer().await.unwrap();
        let from_impolite = last_offer(&p.impolite_relay);

        assert!(p
            .polite
            .receive_offer(from_impolite, ExchangeKind::Renegotiation)
            .await
            .is_err());
        assert!(p.polite.is_stalled());
        assert!(!p.impolite.is_stalled());
        assert_eq!(p.impolite.phase(), SignalingPhase::OfferSent);
        assert!(!p
            .polite_relay
            .sent()
            .iter()
            .any(|s| matches!(s, OutboundSignal::NegoDone { .. })));
    }

    #[tokio::test]
    async fn test_glare_impolite_keeps_offer() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        let before = r.relay.sent().len();
        let outcome = r
            .engine
            .receive_offer(remote_offer(), ExchangeKind::Renegotiation)
            .await
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::IgnoredGlare);
        assert_eq!(r.engine.phase(), SignalingPhase::OfferSent);
        assert_eq!(r.relay.sent().len(), before);
        assert_eq!(r.network.connection(0).unwrap().rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_track_changes_coalesce_into_one_offer() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        r.engine.receive_answer(remote_answer()).await.unwrap();
        r.relay.take_sent();

        let conn = r.network.connection(0).unwrap();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            conn.add_track(Arc::new(FakeTrack::new(kind))).await.unwrap();
            r.engine.tracks_changed();
        }
        assert_eq!(r.engine.phase(), SignalingPhase::Renegotiating);
        assert!(r.engine.run_scheduled_offer().await.unwrap());
        assert!(!r.engine.run_scheduled_offer().await.unwrap());

        let sent = r.relay.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], OutboundSignal::NegoNeeded { .. }));
    }

    #[tokio::test]
    async fn test_failed_renegotiation_keeps_stable() {
        let mut r = rig(Role::Impolite).await;
        r.engine.create_offer().await.unwrap();
        r.engine.receive_answer(remote_answer()).await.unwrap();
        r.network.connection(0).unwrap().fail_next(FakeOp::CreateOffer);
        r.engine.tracks_changed();
        assert!(r.engine.run_scheduled_offer().await.is_err());
        assert_eq!(r.engine.phase(), SignalingPhase::Stable);
        assert!(!r.engine.has_scheduled_offer());
    }

    #[tokio::test]
    async fn test_closed_engine_discards_work() {
        let mut r = rig(Role::Impolite).await;
        r.engine.close();
        assert!(matches!(
            r.engine.create_offer().await,
            Err(CallError::InvalidState(_))
        ));
        assert!(!r.engine.send_local_candidate(candidate(1)));
        assert!(r.relay.sent().is_empty());
    }
}
