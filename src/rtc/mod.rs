//! Multi-peer negotiation engine for mesh audio rooms
//!
//! One relay-coordinated room, N peers, a full mesh of transports. Per peer:
//! a glare-safe offer/answer state machine, buffered ICE exchange, and an
//! authenticated key agreement feeding the encrypted chat path.

pub mod ice;
pub mod negotiation;
pub mod room;
pub mod signaling;
pub mod transport;
pub mod types;


pub use ice::IceBuffer;
pub use negotiation::{NegotiationEngine, NegotiationState};
pub use room::{RejectReason, RoomClient, RoomCommand, RoomConfig, RoomEvent};
pub use signaling::{LinkConfig, SignalingLink};
pub use transport::{
    PeerTransport, RtcTransportFactory, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
pub use types::{
    initiates, is_polite, IceCandidateInit, PeerId, RosterEntry, SdpKind, SignalMessage,
};
