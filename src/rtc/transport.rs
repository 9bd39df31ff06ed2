//! The real-time transport capability consumed by the negotiation engine
//!
//! The engine only sees the [`PeerTransport`] trait: create/apply session
//! descriptions, feed remote ICE candidates, attach outbound audio, close.
//! Transport-originated events re-enter the coordinator through an mpsc
//! channel. `RtcTransport` adapts a webrtc-rs `RTCPeerConnection` to this
//! surface; tests substitute their own implementation.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceConfig;

use super::types::{IceCandidateInit, PeerId, SdpKind};

/// A session description independent of the concrete transport stack.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// Lifecycle state of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Events the transport pushes back into the coordinator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Locally gathered candidate; `None` means gathering finished.
    IceCandidate(Option<IceCandidateInit>),
    ConnectionState(TransportState),
    SignalingState(String),
    RemoteTrack,
    NegotiationNeeded,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;
    /// Discards a pending local offer (polite side of glare).
    async fn rollback_local(&self) -> Result<()>;
    /// `None` is the end-of-candidates marker.
    async fn add_remote_candidate(&self, candidate: Option<IceCandidateInit>) -> Result<()>;
    async fn attach_outbound_audio(&self) -> Result<()>;
    async fn replace_outbound_audio(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Builds one transport per remote peer, wired to the shared event channel.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer: &PeerId,
        events: mpsc::Sender<(PeerId, TransportEvent)>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

/// webrtc-rs backed transport.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    audio_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcTransport {
    async fn new(
        ice: &IceConfig,
        peer: &PeerId,
        events: mpsc::Sender<(PeerId, TransportEvent)>,
    ) -> Result<Arc<Self>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers: Vec<RTCIceServer> = ice
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        if let Some(turn) = &ice.turn {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        {
            let tx = events.clone();
            let peer = peer.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let init = candidate.and_then(|c| c.to_json().ok()).map(from_rtc_candidate);
                    let _ = tx.send((peer, TransportEvent::IceCandidate(init))).await;
                })
            }));
        }

        {
            let tx = events.clone();
            let peer = peer.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let _ = tx
                        .send((peer, TransportEvent::ConnectionState(map_state(state))))
                        .await;
                })
            }));
        }

        {
            let tx = events.clone();
            let peer = peer.clone();
            pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let tx = tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let _ = tx
                        .send((peer, TransportEvent::SignalingState(state.to_string())))
                        .await;
                })
            }));
        }

        {
            let tx = events.clone();
            let peer = peer.clone();
            pc.on_track(Box::new(move |_track, _receiver, _transceiver| {
                let tx = tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let _ = tx.send((peer, TransportEvent::RemoteTrack)).await;
                })
            }));
        }

        {
            let tx = events;
            let peer = peer.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let tx = tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let _ = tx.send((peer, TransportEvent::NegotiationNeeded)).await;
                })
            }));
        }

        Ok(Arc::new(Self {
            pc,
            audio_sender: Mutex::new(None),
        }))
    }

    /// A fresh per-peer outbound audio track. Each peer owns its own clone of
    /// the local capture, so stopping one never affects the others.
    fn new_audio_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "callmesh".to_owned(),
        ))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn rollback_local(&self) -> Result<()> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Option<IceCandidateInit>) -> Result<()> {
        let init = match candidate {
            Some(c) => to_rtc_candidate(c),
            // Empty candidate string is the end-of-candidates marker.
            None => RTCIceCandidateInit::default(),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn attach_outbound_audio(&self) -> Result<()> {
        let mut guard = self.audio_sender.lock().await;
        if guard.is_some() {
            debug!("outbound audio already attached");
            return Ok(());
        }
        let track: Arc<dyn TrackLocal + Send + Sync> = Self::new_audio_track();
        let sender = self.pc.add_track(track).await?;
        *guard = Some(sender);
        Ok(())
    }

    async fn replace_outbound_audio(&self) -> Result<()> {
        let guard = self.audio_sender.lock().await;
        match guard.as_ref() {
            Some(sender) => {
                let track: Arc<dyn TrackLocal + Send + Sync> = Self::new_audio_track();
                sender.replace_track(Some(track)).await?;
                Ok(())
            }
            None => {
                drop(guard);
                self.attach_outbound_audio().await
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct RtcTransportFactory {
    ice: IceConfig,
}

impl RtcTransportFactory {
    pub fn new(ice: IceConfig) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: mpsc::Sender<(PeerId, TransportEvent)>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = RtcTransport::new(&self.ice, peer, events)
            .await
            .with_context(|| format!("failed to create transport for {}", peer.short()))?;
        Ok(transport)
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
    };
    Ok(rtc)
}

fn to_rtc_candidate(c: IceCandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn from_rtc_candidate(c: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}
