pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcConnection, RtcConnectionFactory};
pub use negotiation::{AnswerOutcome, NegotiationEngine};
pub use state::{ExchangeKind, NegotiationState, Role, SignalingPhase};
pub use transport::{
    ChannelId, ConnectionFactory, ConnectionState, ConnectionTransport, DataChannel, PeerEvent,
    PeerEventSink, SessionEvent, SessionId,
};
pub use types::{
    IceCandidate, ParticipantId, RemoteTrack, RoomId, SdpType, ServerConfig, SessionDescription,
    TrackKind,
};
