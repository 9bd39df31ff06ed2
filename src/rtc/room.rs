//! Roster coordination and per-peer session lifecycle
//!
//! The coordinator owns the authoritative mirror of the relay roster and an
//! explicit session registry keyed by peer id. Inbound signaling is demuxed
//! by message type and sender; transport events re-enter here tagged with
//! their peer. Sessions are created lazily on the first signaling or media
//! need for a peer and purged the moment the peer leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{chat, ChatError, KeyEvent, KeyExchange};

use super::ice::{looks_unusable, IceBuffer};
use super::negotiation::NegotiationEngine;
use super::transport::{PeerTransport, TransportEvent, TransportFactory, TransportState};
use super::types::{initiates, is_polite, IceCandidateInit, PeerId, RosterEntry, SignalMessage};

/// Coordinator tuning, distilled from [`Config`].
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub stable_wait: Duration,
    pub max_ice_restarts: u32,
    pub max_chat_len: usize,
    pub max_name_len: usize,
}

impl From<&Config> for RoomConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            stable_wait: cfg.stable_wait(),
            max_ice_restarts: cfg.call.max_ice_restarts,
            max_chat_len: cfg.call.max_chat_len,
            max_name_len: cfg.call.max_name_len,
        }
    }
}

/// Commands from the embedding application.
#[derive(Debug)]
pub enum RoomCommand {
    /// Publish the display name and start calling known peers.
    Join { name: String },
    /// Encrypt and fan out a chat line to every keyed peer.
    Chat { text: String },
    /// The local capture changed; swap outbound tracks and renegotiate.
    ReplaceAudio,
    /// The user compared fingerprints out of band and confirmed this peer.
    MarkVerified { peer: PeerId },
    Leave,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Admitted to the room; carries our relay-issued id.
    Welcomed { id: PeerId, roster: Vec<RosterEntry> },
    RosterUpdated { roster: Vec<RosterEntry> },
    PeerJoined { id: PeerId },
    PeerLeft { id: PeerId },
    Chat {
        from: PeerId,
        name: String,
        text: String,
        ts: u64,
    },
    /// A peer's key arrived or changed; on `rotated`, any prior trust in the
    /// old fingerprint no longer holds.
    KeyFingerprint {
        peer: PeerId,
        fingerprint: String,
        rotated: bool,
    },
    PeerVerified { peer: PeerId },
    PeerState { peer: PeerId, state: TransportState },
    RemoteAudio { peer: PeerId },
    /// Admission refused; the session is over, no retry.
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone)]
pub enum RejectReason {
    RoomFull { capacity: Option<u32> },
    BrowserOnly,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::RoomFull { capacity: Some(n) } => {
                write!(f, "room is full (capacity {n})")
            }
            RejectReason::RoomFull { capacity: None } => write!(f, "room is full"),
            RejectReason::BrowserOnly => write!(f, "relay admits browser clients only"),
        }
    }
}

struct PeerSession {
    engine: Arc<NegotiationEngine>,
    driver: JoinHandle<()>,
    transport: Arc<dyn PeerTransport>,
    restart_attempts: u32,
    got_track: bool,
}

enum Flow {
    Continue,
    Stop,
}

pub struct RoomClient {
    cfg: RoomConfig,
    local_id: Option<PeerId>,
    display_name: String,
    joined: bool,
    roster: HashMap<PeerId, String>,
    sessions: HashMap<PeerId, PeerSession>,
    ice: IceBuffer,
    keys: KeyExchange,
    outbound: mpsc::Sender<SignalMessage>,
    events: mpsc::Sender<RoomEvent>,
    transports: Arc<dyn TransportFactory>,
    transport_events_tx: mpsc::Sender<(PeerId, TransportEvent)>,
    active_tx: watch::Sender<bool>,
}

impl RoomClient {
    /// Builds the coordinator. Returns the receiver half of the transport
    /// event channel to pass back into [`RoomClient::run`].
    pub fn new(
        cfg: RoomConfig,
        transports: Arc<dyn TransportFactory>,
        outbound: mpsc::Sender<SignalMessage>,
        events: mpsc::Sender<RoomEvent>,
        active_tx: watch::Sender<bool>,
    ) -> (Self, mpsc::Receiver<(PeerId, TransportEvent)>) {
        let (transport_events_tx, transport_events_rx) = mpsc::channel(256);
        let client = Self {
            cfg,
            local_id: None,
            display_name: String::new(),
            joined: false,
            roster: HashMap::new(),
            sessions: HashMap::new(),
            ice: IceBuffer::new(),
            keys: KeyExchange::new(),
            outbound,
            events,
            transports,
            transport_events_tx,
            active_tx,
        };
        (client, transport_events_rx)
    }

    /// Fingerprint of the local session key, displayable before any peer is
    /// known.
    pub fn local_fingerprint(&self) -> String {
        self.keys.local_fingerprint()
    }

    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<SignalMessage>,
        mut transport_events: mpsc::Receiver<(PeerId, TransportEvent)>,
        mut commands: mpsc::Receiver<RoomCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => match self.handle_signal(msg).await {
                        Ok(Flow::Stop) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => warn!("signal handling failed: {e:#}"),
                    },
                    None => break,
                },
                ev = transport_events.recv() => match ev {
                    Some((peer, ev)) => self.handle_transport_event(peer, ev).await,
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(cmd) => match self.handle_command(cmd).await {
                        Flow::Stop => break,
                        Flow::Continue => {}
                    },
                    None => break,
                },
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn handle_signal(&mut self, msg: SignalMessage) -> Result<Flow> {
        match msg {
            SignalMessage::Hello { id, roster } => {
                info!("joined room as {}", id.short());
                self.keys.bind(id.clone());
                self.local_id = Some(id.clone());
                self.apply_roster(&roster).await;
                self.emit(RoomEvent::Welcomed { id, roster }).await;
                self.announce_keys().await;
                if self.joined {
                    // A hello after a relay reconnect: flush our name and
                    // re-establish whatever negotiation flags accumulated.
                    self.send_name().await;
                    self.call_known_peers().await?;
                }
            }
            SignalMessage::Roster { roster } => {
                self.apply_roster(&roster).await;
                self.emit(RoomEvent::RosterUpdated { roster }).await;
                self.announce_keys().await;
                if self.joined {
                    self.call_known_peers().await?;
                }
            }
            SignalMessage::PeerJoined { id } => {
                if self.local_id.as_ref() == Some(&id) {
                    return Ok(Flow::Continue);
                }
                info!("peer joined: {}", id.short());
                self.roster.entry(id.clone()).or_default();
                self.emit(RoomEvent::PeerJoined { id: id.clone() }).await;
                self.send(SignalMessage::key(&id, self.keys.public_key_b64()))
                    .await;
                if self.joined {
                    self.maybe_call(&id).await?;
                }
            }
            SignalMessage::PeerLeft { id } => {
                info!("peer left: {}", id.short());
                self.roster.remove(&id);
                self.purge_session(&id, true).await;
                self.emit(RoomEvent::PeerLeft { id }).await;
            }
            SignalMessage::Offer { from: Some(from), sdp, .. } => {
                self.roster.entry(from.clone()).or_default();
                let engine = self.ensure_session(&from).await?.engine.clone();
                if engine.handle_remote_offer(sdp).await {
                    self.flush_ice(&from).await;
                }
            }
            SignalMessage::Answer { from: Some(from), sdp, .. } => {
                let engine = self.sessions.get(&from).map(|s| s.engine.clone());
                match engine {
                    Some(engine) => {
                        if engine.handle_remote_answer(sdp).await {
                            self.flush_ice(&from).await;
                        }
                    }
                    None => debug!("answer from {} without a session", from.short()),
                }
            }
            SignalMessage::Ice { from: Some(from), candidate, .. } => {
                self.handle_remote_candidate(from, candidate).await;
            }
            SignalMessage::Key { from: Some(from), public_key, .. } => {
                match self.keys.receive(&from, &public_key) {
                    Ok(KeyEvent::Unchanged) => {}
                    Ok(event) => {
                        let fingerprint = self
                            .keys
                            .fingerprint(&from)
                            .unwrap_or_default()
                            .to_string();
                        let rotated = event == KeyEvent::Rotated;
                        if rotated {
                            warn!("key rotated for {}, prior trust invalidated", from.short());
                        }
                        self.emit(RoomEvent::KeyFingerprint {
                            peer: from,
                            fingerprint,
                            rotated,
                        })
                        .await;
                    }
                    Err(e) => debug!("discarding bad key from {}: {e:#}", from.short()),
                }
            }
            SignalMessage::ChatE2e { from: Some(from), iv, ct, ts, .. } => {
                self.handle_chat(from, iv, ct, ts).await;
            }
            SignalMessage::SafetyOk { from: Some(from), .. } => {
                if self.keys.mark_verified(&from) {
                    self.emit(RoomEvent::PeerVerified { peer: from }).await;
                } else {
                    debug!("safety-ok from {} before any key", from.short());
                }
            }
            SignalMessage::Full { capacity } => {
                warn!("room admission rejected: full");
                self.emit(RoomEvent::Rejected {
                    reason: RejectReason::RoomFull { capacity },
                })
                .await;
                let _ = self.active_tx.send(false);
                return Ok(Flow::Stop);
            }
            SignalMessage::BrowserOnly { .. } => {
                warn!("room admission rejected: browser-only relay");
                self.emit(RoomEvent::Rejected {
                    reason: RejectReason::BrowserOnly,
                })
                .await;
                let _ = self.active_tx.send(false);
                return Ok(Flow::Stop);
            }
            other => debug!("ignoring {} without sender", other.msg_type()),
        }
        Ok(Flow::Continue)
    }

    async fn handle_command(&mut self, cmd: RoomCommand) -> Flow {
        match cmd {
            RoomCommand::Join { name } => {
                self.display_name = truncated(&name, self.cfg.max_name_len);
                self.joined = true;
                self.send_name().await;
                // Sessions created before joining have no outbound audio yet.
                for session in self.sessions.values() {
                    if let Err(e) = session.transport.attach_outbound_audio().await {
                        warn!("attaching audio failed: {e:#}");
                    }
                    session.engine.request_negotiation(false);
                }
                if let Err(e) = self.call_known_peers().await {
                    warn!("calling peers failed: {e:#}");
                }
            }
            RoomCommand::Chat { text } => self.send_chat(&text).await,
            RoomCommand::ReplaceAudio => {
                for session in self.sessions.values() {
                    match session.transport.replace_outbound_audio().await {
                        Ok(()) => session.engine.request_negotiation(false),
                        Err(e) => warn!("replacing audio failed: {e:#}"),
                    }
                }
            }
            RoomCommand::MarkVerified { peer } => {
                if self.keys.mark_verified(&peer) {
                    self.send(SignalMessage::SafetyOk {
                        to: Some(peer.clone()),
                        from: None,
                    })
                    .await;
                    self.emit(RoomEvent::PeerVerified { peer }).await;
                } else {
                    debug!("cannot verify {} before key exchange", peer.short());
                }
            }
            RoomCommand::Leave => {
                info!("leaving room");
                self.joined = false;
                let _ = self.active_tx.send(false);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn handle_transport_event(&mut self, peer: PeerId, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.send(SignalMessage::ice(&peer, candidate)).await;
            }
            TransportEvent::ConnectionState(state) => {
                debug!("peer {} transport {state}", peer.short());
                self.emit(RoomEvent::PeerState {
                    peer: peer.clone(),
                    state,
                })
                .await;
                match state {
                    TransportState::Connected => {
                        if let Some(session) = self.sessions.get_mut(&peer) {
                            session.restart_attempts = 0;
                        }
                    }
                    TransportState::Failed | TransportState::Disconnected => {
                        self.recover_peer(&peer).await;
                    }
                    TransportState::Closed => {
                        // Terminal for this transport: a wholly new session
                        // is the only way forward.
                        self.rebuild_session(&peer).await;
                    }
                    _ => {}
                }
            }
            TransportEvent::SignalingState(state) => {
                debug!("peer {} signaling state {state}", peer.short());
            }
            TransportEvent::RemoteTrack => {
                let first = match self.sessions.get_mut(&peer) {
                    Some(session) if !session.got_track => {
                        session.got_track = true;
                        true
                    }
                    _ => false,
                };
                if first {
                    self.emit(RoomEvent::RemoteAudio { peer }).await;
                }
            }
            TransportEvent::NegotiationNeeded => {
                if let Some(session) = self.sessions.get(&peer) {
                    session.engine.request_negotiation(false);
                }
            }
        }
    }

    /// ICE restart first; once attempts are exhausted the session is rebuilt
    /// from scratch.
    async fn recover_peer(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.restart_attempts < self.cfg.max_ice_restarts {
            session.restart_attempts += 1;
            warn!(
                "peer {} transport degraded, ICE restart {}/{}",
                peer.short(),
                session.restart_attempts,
                self.cfg.max_ice_restarts
            );
            session.engine.request_negotiation(true);
        } else {
            warn!("peer {} restarts exhausted, rebuilding session", peer.short());
            self.rebuild_session(peer).await;
        }
    }

    /// Purges the session (keeping key material: same identity) and, when
    /// the peer is still rostered and we are the caller, dials again.
    async fn rebuild_session(&mut self, peer: &PeerId) {
        self.purge_session(peer, false).await;
        if !self.joined || !self.roster.contains_key(peer) {
            return;
        }
        let local = match self.local_id.clone() {
            Some(id) => id,
            None => return,
        };
        if initiates(&local, peer) {
            if let Err(e) = self.maybe_call(peer).await {
                warn!("recreating session for {} failed: {e:#}", peer.short());
            }
        }
    }

    async fn handle_remote_candidate(
        &mut self,
        from: PeerId,
        candidate: Option<IceCandidateInit>,
    ) {
        match candidate {
            // End-of-candidates passes straight through, never buffered.
            None => {
                if let Some(session) = self.sessions.get(&from) {
                    if let Err(e) = session.transport.add_remote_candidate(None).await {
                        debug!("end-of-candidates apply failed: {e:#}");
                    }
                }
            }
            Some(c) => {
                if looks_unusable(&c) {
                    debug!("dropping unusable candidate from {}", from.short());
                    return;
                }
                match self.sessions.get(&from) {
                    Some(session) if session.engine.has_remote_description() => {
                        if let Err(e) = session.transport.add_remote_candidate(Some(c)).await {
                            debug!("candidate apply failed: {e:#}");
                        }
                    }
                    _ => self.ice.enqueue(&from, c),
                }
            }
        }
    }

    async fn handle_chat(&mut self, from: PeerId, iv: String, ct: String, ts: u64) {
        let result = match self.keys.chat_key(&from) {
            Some(key) => chat::open(key, &iv, &ct),
            None => Err(ChatError::MissingKey),
        };
        match result {
            Ok(text) => {
                let name = self.roster.get(&from).cloned().unwrap_or_default();
                self.emit(RoomEvent::Chat {
                    from,
                    name,
                    text,
                    ts,
                })
                .await;
            }
            Err(e) => {
                // Drop the message and re-announce our key so the sender can
                // re-derive and retry on their side.
                debug!("dropping chat from {}: {e}", from.short());
                self.send(SignalMessage::key(&from, self.keys.public_key_b64()))
                    .await;
            }
        }
    }

    async fn send_chat(&mut self, text: &str) {
        let text = truncated(text.trim(), self.cfg.max_chat_len);
        if text.is_empty() {
            return;
        }
        let ts = unix_millis();
        let recipients: Vec<PeerId> = self
            .roster
            .keys()
            .filter(|id| Some(*id) != self.local_id.as_ref())
            .cloned()
            .collect();
        for peer in recipients {
            // Each peer gets its own ciphertext under its own pair key; peers
            // without a key yet are skipped, not queued.
            let Some(key) = self.keys.chat_key(&peer) else {
                debug!("no chat key for {}, skipping", peer.short());
                continue;
            };
            match chat::seal(key, &text) {
                Ok(sealed) => {
                    self.send(SignalMessage::ChatE2e {
                        to: Some(peer.clone()),
                        from: None,
                        iv: sealed.iv,
                        ct: sealed.ct,
                        ts,
                    })
                    .await;
                }
                Err(e) => warn!("sealing chat for {} failed: {e}", peer.short()),
            }
        }
    }

    async fn apply_roster(&mut self, roster: &[RosterEntry]) {
        self.roster = roster
            .iter()
            .map(|e| (e.id.clone(), e.name.clone()))
            .collect();
        // Sessions for peers no longer present are dead weight.
        let gone: Vec<PeerId> = self
            .sessions
            .keys()
            .filter(|id| !self.roster.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            debug!("roster dropped {}, purging session", id.short());
            self.purge_session(&id, true).await;
        }
    }

    /// Broadcasts the local public key to every rostered peer individually.
    async fn announce_keys(&mut self) {
        let public_key = self.keys.public_key_b64();
        let peers: Vec<PeerId> = self
            .roster
            .keys()
            .filter(|id| Some(*id) != self.local_id.as_ref())
            .cloned()
            .collect();
        for peer in peers {
            self.send(SignalMessage::key(&peer, public_key.clone())).await;
        }
    }

    async fn call_known_peers(&mut self) -> Result<()> {
        let peers: Vec<PeerId> = self
            .roster
            .keys()
            .filter(|id| Some(*id) != self.local_id.as_ref())
            .cloned()
            .collect();
        for peer in peers {
            self.maybe_call(&peer).await?;
        }
        Ok(())
    }

    /// Dials a peer if we hold the caller role for the pair. The callee side
    /// creates its session lazily when the offer arrives.
    async fn maybe_call(&mut self, peer: &PeerId) -> Result<()> {
        let local = self
            .local_id
            .clone()
            .context("no local id before calling peers")?;
        if !initiates(&local, peer) {
            return Ok(());
        }
        if !self.sessions.contains_key(peer) {
            self.ensure_session(peer).await?;
        }
        if let Some(session) = self.sessions.get(peer) {
            session.engine.request_negotiation(false);
        }
        Ok(())
    }

    async fn ensure_session(&mut self, peer: &PeerId) -> Result<&mut PeerSession> {
        if !self.sessions.contains_key(peer) {
            let local = self
                .local_id
                .clone()
                .context("no local id before creating a session")?;
            let transport = self
                .transports
                .create(peer, self.transport_events_tx.clone())
                .await?;
            if self.joined {
                if let Err(e) = transport.attach_outbound_audio().await {
                    warn!("attaching audio for {} failed: {e:#}", peer.short());
                }
            }
            let engine = Arc::new(NegotiationEngine::new(
                peer.clone(),
                is_polite(&local, peer),
                transport.clone(),
                self.outbound.clone(),
                self.cfg.stable_wait,
            ));
            let driver = engine.spawn_driver();
            info!(
                "session created for {} (polite: {})",
                peer.short(),
                engine.is_polite()
            );
            self.sessions.insert(
                peer.clone(),
                PeerSession {
                    engine,
                    driver,
                    transport,
                    restart_attempts: 0,
                    got_track: false,
                },
            );
        }
        Ok(self.sessions.get_mut(peer).expect("session just inserted"))
    }

    /// Applies everything buffered for a peer, in arrival order, exactly
    /// once. Called right after a remote description lands.
    async fn flush_ice(&mut self, peer: &PeerId) {
        let queued = self.ice.drain(peer);
        if queued.is_empty() {
            return;
        }
        let Some(session) = self.sessions.get(peer) else {
            return;
        };
        debug!("flushing {} buffered candidates for {}", queued.len(), peer.short());
        for candidate in queued {
            if let Err(e) = session.transport.add_remote_candidate(Some(candidate)).await {
                debug!("buffered candidate apply failed: {e:#}");
            }
        }
    }

    async fn purge_session(&mut self, peer: &PeerId, drop_keys: bool) {
        if let Some(session) = self.sessions.remove(peer) {
            session.engine.close().await;
            session.driver.abort();
        }
        self.ice.purge(peer);
        if drop_keys {
            self.keys.forget(peer);
        }
    }

    async fn send_name(&mut self) {
        self.send(SignalMessage::Name {
            name: self.display_name.clone(),
        })
        .await;
    }

    async fn send(&mut self, msg: SignalMessage) {
        if self.outbound.send(msg).await.is_err() {
            debug!("signaling channel closed, message dropped");
        }
    }

    async fn emit(&mut self, event: RoomEvent) {
        let _ = self.events.send(event).await;
    }

    async fn shutdown(&mut self) {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.purge_session(&peer, true).await;
        }
        let _ = self.active_tx.send(false);
        info!("room client stopped");
    }
}

fn truncated(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
