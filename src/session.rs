use crate::media::{LocalMedia, TrackInfo};
use crate::messenger::Messenger;
use crate::peer::negotiation::NegotiationEngine;
use crate::peer::transport::{ConnectionState, ConnectionTransport, SessionId};
use crate::peer::types::{IceCandidate, ParticipantId, RemoteTrack};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Один звонок с одним удалённым участником. Создаётся на каждый звонок
/// и выбрасывается после teardown, между звонками ничего не переживает.
pub struct CallSession {
    pub id: SessionId,
    pub remote: ParticipantId,
    connection: Arc<dyn ConnectionTransport>,
    pub negotiation: NegotiationEngine,
    pub messenger: Messenger,
    media: Option<LocalMedia>,
    tracks_attached: bool,
    remote_tracks: Vec<RemoteTrack>,
    pub connection_state: ConnectionState,
    /// `call:initiated` от удалённой стороны уже был
    pub remote_rang: bool,
}

impl CallSession {
    pub fn new(
        id: SessionId,
        remote: ParticipantId,
        connection: Arc<dyn ConnectionTransport>,
        negotiation: NegotiationEngine,
        messenger: Messenger,
        media: LocalMedia,
    ) -> Self {
        Self {
            id,
            remote,
            connection,
            negotiation,
            messenger,
            media: Some(media),
            tracks_attached: false,
            remote_tracks: Vec::new(),
            connection_state: ConnectionState::New,
            remote_rang: false,
        }
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    pub fn tracks_attached(&self) -> bool {
        self.tracks_attached
    }

    pub fn local_tracks(&self) -> Vec<TrackInfo> {
        self.media.as_ref().map(LocalMedia::infos).unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        if self.remote_tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.remote_tracks.push(track);
        true
    }

    /// Отложенный «send stream»: треки добавляются в соединение один раз,
    /// пересогласование планируется через движок.
    pub async fn attach_tracks(&mut self) -> crate::error::Result<usize> {
        if self.tracks_attached {
            return Ok(0);
        }
        let Some(media) = &self.media else {
            return Ok(0);
        };
        let tracks = media.tracks().to_vec();
        for track in &tracks {
            self.connection.add_track(track.clone()).await?;
            self.negotiation.tracks_changed();
        }
        self.tracks_attached = true;
        info!("Attached {} local tracks to session {}", tracks.len(), self.id);
        Ok(tracks.len())
    }

    /// Кандидаты, пришедшие до создания сессии
    pub async fn adopt_early_candidates(&mut self, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = self.negotiation.add_ice_candidate(candidate).await {
                warn!("Dropping early candidate: {e}");
            }
        }
    }

    /// Порядок строгий: соединение, локальные треки, удалённый поток.
    /// Возвращает число остановленных треков.
    pub async fn teardown(mut self) -> usize {
        self.negotiation.close();
        if let Err(e) = self.connection.close().await {
            warn!("Error closing connection of session {}: {e}", self.id);
        }
        let stopped = self
            .media
            .take()
            .map(|media| media.stop_all())
            .unwrap_or_default();
        self.remote_tracks.clear();
        self.messenger.close().await;
        debug!(
            "Session {} with {} torn down, {stopped} tracks stopped",
            self.id, self.remote
        );
        stopped
    }
}
