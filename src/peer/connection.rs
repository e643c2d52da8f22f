use crate::error::{CallError, Result};
use crate::logger::dump_selected_pair;
use crate::media::MediaTrack;
use crate::peer::data_channel::attach_dc;
use crate::peer::transport::{
    ConnectionFactory, ConnectionState, ConnectionTransport, DataChannel, PeerEvent, PeerEventSink,
};
use crate::peer::types::{
    IceCandidate, RemoteTrack, SdpType, ServerConfig, SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

fn rtc_error(op: &str, e: webrtc::Error) -> CallError {
    CallError::NegotiationError(format!("{op}: {e}"))
}

/// Фабрика соединений webrtc-rs с заданными ICE серверами
pub struct RtcConnectionFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcConnectionFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn connect(&self, sink: PeerEventSink) -> Result<Arc<dyn ConnectionTransport>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| rtc_error("register codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| rtc_error("register interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&self.ice_servers))
                .await
                .map_err(|e| rtc_error("new peer connection", e))?,
        );
        install_handlers(&pc, &sink);
        info!("Created peer connection for session {}", sink.session());
        Ok(Arc::new(RtcConnection { pc, sink }))
    }
}

/// Колбэки соединения пишут в sink, состояние ядра они не трогают
fn install_handlers(pc: &Arc<RTCPeerConnection>, sink: &PeerEventSink) {
    pc.on_ice_candidate(Box::new({
        let sink = sink.clone();
        move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Cannot serialize local candidate: {e}"),
                },
                // None означает конец сбора
                None => debug!("ICE candidate gathering completed"),
            }
            Box::pin(async {})
        }
    }));

    let weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new({
        let sink = sink.clone();
        move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {st:?}");
            if matches!(
                st,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
            ) {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            sink.emit(PeerEvent::StateChanged(map_state(st)));
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new({
        let sink = sink.clone();
        move |dc: Arc<RTCDataChannel>| {
            let channel = attach_dc(dc, sink.clone());
            sink.emit(PeerEvent::RemoteChannel(channel));
            Box::pin(async {})
        }
    }));

    let track_sink = sink.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        track_sink.emit(PeerEvent::RemoteTrack(RemoteTrack {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
        }));
        Box::pin(async {})
    }));
}

/// [`ConnectionTransport`] поверх `RTCPeerConnection`
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    sink: PeerEventSink,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let converted = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|e| rtc_error("parse description", e))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(CallError::NegotiationError(format!(
            "unexpected description type {other}"
        ))),
    }
}

#[async_trait]
impl ConnectionTransport for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_error("create offer", e))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| rtc_error("create answer", e))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| rtc_error("set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| rtc_error("set remote description", e))
    }

    /// webrtc-rs 0.13 отклоняет откат из have-local-offer, ошибка уходит
    /// в движок согласования
    async fn rollback_local_description(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| rtc_error("rollback", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let ice_candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(ice_candidate)
            .await
            .map_err(|e| rtc_error("add ICE candidate", e))
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let Some(rtp) = track.rtp_track() else {
            return Err(CallError::MediaUnavailable(format!(
                "track {} has no RTP binding",
                track.id()
            )));
        };
        self.pc
            .add_track(rtp)
            .await
            .map_err(|e| rtc_error("add track", e))?;
        debug!(
            "Added {:?} track {} to session {}",
            track.kind(),
            track.id(),
            self.sink.session()
        );
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| rtc_error("create data channel", e))?;
        Ok(attach_dc(dc, self.sink.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| rtc_error("close", e))
    }
}
