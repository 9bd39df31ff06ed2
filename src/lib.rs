pub mod config;
pub mod crypto;
pub mod rtc;

pub use config::Config;
pub use crypto::{ChatError, KeyExchange};
pub use rtc::{
    LinkConfig, PeerId, RoomClient, RoomCommand, RoomConfig, RoomEvent, RtcTransportFactory,
    SignalMessage, SignalingLink,
};
