//! Glare-safe offer/answer state machine, one instance per remote peer
//!
//! Negotiation triggers (roster churn, media changes, ICE restarts, the
//! transport's own renegotiation-needed signal) only set a flag; a single
//! driver task per peer drains it, so bursts collapse and at most one offer
//! is ever in flight. Offer glare resolves through the polite/impolite split:
//! the impolite side keeps its own offer, the polite side rolls back and
//! answers the remote one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{PeerTransport, SessionDescription};
use super::types::{PeerId, SdpKind, SignalMessage};

/// Where the peer stands in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NegotiationState::Stable => "stable",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Default)]
struct Flags {
    needs_negotiation: bool,
    ice_restart: bool,
}

pub struct NegotiationEngine {
    peer_id: PeerId,
    polite: bool,
    transport: Arc<dyn PeerTransport>,
    outbound: mpsc::Sender<SignalMessage>,
    state_tx: watch::Sender<NegotiationState>,
    flags: Mutex<Flags>,
    kick: Notify,
    stable_wait: Duration,
    remote_description: AtomicBool,
}

impl NegotiationEngine {
    pub fn new(
        peer_id: PeerId,
        polite: bool,
        transport: Arc<dyn PeerTransport>,
        outbound: mpsc::Sender<SignalMessage>,
        stable_wait: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(NegotiationState::Stable);
        Self {
            peer_id,
            polite,
            transport,
            outbound,
            state_tx,
            flags: Mutex::new(Flags::default()),
            kick: Notify::new(),
            stable_wait,
            remote_description: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_tx.borrow()
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    /// Whether a remote description has been applied; gates direct candidate
    /// application versus buffering.
    pub fn has_remote_description(&self) -> bool {
        self.remote_description.load(Ordering::Acquire)
    }

    /// Flags that another offer/answer round is wanted and wakes the driver.
    /// Safe to call from any context, any number of times; triggers coalesce.
    pub fn request_negotiation(&self, ice_restart: bool) {
        if self.state() == NegotiationState::Closed {
            return;
        }
        {
            let mut flags = self.flags.lock().unwrap();
            flags.needs_negotiation = true;
            flags.ice_restart |= ice_restart;
        }
        self.kick.notify_one();
    }

    /// Spawns the per-peer driver that turns accumulated triggers into
    /// at most one in-flight offer at a time.
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.drive().await })
    }

    async fn drive(&self) {
        loop {
            self.kick.notified().await;
            if self.state() == NegotiationState::Closed {
                return;
            }
            loop {
                let restart = {
                    let mut flags = self.flags.lock().unwrap();
                    if !flags.needs_negotiation {
                        break;
                    }
                    flags.needs_negotiation = false;
                    std::mem::take(&mut flags.ice_restart)
                };

                if !self.wait_for_stable().await {
                    if self.state() == NegotiationState::Closed {
                        return;
                    }
                    // Wedged mid-exchange: abandon this cycle and re-arm so
                    // the next external trigger picks it back up.
                    debug!(peer = %self.peer_id.short(), "stable-wait expired, re-arming");
                    let mut flags = self.flags.lock().unwrap();
                    flags.needs_negotiation = true;
                    flags.ice_restart |= restart;
                    break;
                }

                if let Err(e) = self.send_offer(restart).await {
                    warn!(peer = %self.peer_id.short(), "offer failed, will retry: {e:#}");
                    let mut flags = self.flags.lock().unwrap();
                    flags.needs_negotiation = true;
                    flags.ice_restart |= restart;
                    break;
                }
                // Loop re-checks the flag: triggers that arrived mid-cycle
                // fold into one more exchange once the answer lands.
            }
        }
    }

    async fn wait_for_stable(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        let deadline = tokio::time::Instant::now() + self.stable_wait;
        loop {
            match *rx.borrow_and_update() {
                NegotiationState::Stable => return true,
                NegotiationState::Closed => return false,
                _ => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return false,
            }
        }
    }

    async fn send_offer(&self, ice_restart: bool) -> anyhow::Result<()> {
        let offer = self.transport.create_offer(ice_restart).await?;
        self.transport.set_local_description(&offer).await?;
        self.set_state(NegotiationState::HaveLocalOffer);
        debug!(peer = %self.peer_id.short(), ice_restart, "sending offer");
        let _ = self
            .outbound
            .send(SignalMessage::offer(&self.peer_id, offer.sdp))
            .await;
        Ok(())
    }

    /// Applies a remote offer, resolving glare by role, and sends the answer.
    /// Returns true when the remote description was applied (the caller then
    /// flushes buffered candidates).
    pub async fn handle_remote_offer(&self, sdp: String) -> bool {
        match self.state() {
            NegotiationState::Closed => {
                debug!(peer = %self.peer_id.short(), "offer for closed session ignored");
                return false;
            }
            NegotiationState::HaveLocalOffer => {
                if !self.polite {
                    // Glare: the impolite side's own offer wins.
                    debug!(peer = %self.peer_id.short(), "glare: ignoring incoming offer");
                    return false;
                }
                if let Err(e) = self.transport.rollback_local().await {
                    warn!(peer = %self.peer_id.short(), "rollback failed: {e:#}");
                    self.request_negotiation(false);
                    return false;
                }
                info!(peer = %self.peer_id.short(), "glare: rolled back local offer");
                self.set_state(NegotiationState::Stable);
            }
            _ => {}
        }

        let offer = SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        };
        if let Err(e) = self.transport.set_remote_description(&offer).await {
            warn!(peer = %self.peer_id.short(), "applying remote offer failed: {e:#}");
            self.request_negotiation(false);
            return false;
        }
        self.remote_description.store(true, Ordering::Release);
        self.set_state(NegotiationState::HaveRemoteOffer);

        let answer = match self.transport.create_answer().await {
            Ok(a) => a,
            Err(e) => {
                warn!(peer = %self.peer_id.short(), "creating answer failed: {e:#}");
                self.set_state(NegotiationState::Stable);
                self.request_negotiation(false);
                return true;
            }
        };
        if let Err(e) = self.transport.set_local_description(&answer).await {
            warn!(peer = %self.peer_id.short(), "applying local answer failed: {e:#}");
            self.set_state(NegotiationState::Stable);
            self.request_negotiation(false);
            return true;
        }
        self.set_state(NegotiationState::Stable);
        debug!(peer = %self.peer_id.short(), "answered remote offer");
        let _ = self
            .outbound
            .send(SignalMessage::answer(&self.peer_id, answer.sdp))
            .await;
        true
    }

    /// Applies a remote answer if one is actually awaited. Duplicate, late or
    /// rolled-back answers are discarded; applying them out of context is
    /// unsafe and the stalled exchange gets re-triggered by connection-state
    /// observation instead.
    pub async fn handle_remote_answer(&self, sdp: String) -> bool {
        if self.state() != NegotiationState::HaveLocalOffer {
            debug!(
                peer = %self.peer_id.short(),
                state = %self.state(),
                "out-of-context answer discarded"
            );
            return false;
        }
        let answer = SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        };
        if let Err(e) = self.transport.set_remote_description(&answer).await {
            warn!(peer = %self.peer_id.short(), "applying remote answer failed: {e:#}");
            self.set_state(NegotiationState::Stable);
            self.request_negotiation(false);
            return false;
        }
        self.remote_description.store(true, Ordering::Release);
        self.set_state(NegotiationState::Stable);
        debug!(peer = %self.peer_id.short(), "remote answer applied");
        true
    }

    /// Terminal: stops the driver and closes the transport. The session must
    /// be recreated from scratch to talk to this peer again.
    pub async fn close(&self) {
        self.set_state(NegotiationState::Closed);
        self.kick.notify_one();
        if let Err(e) = self.transport.close().await {
            debug!(peer = %self.peer_id.short(), "transport close: {e:#}");
        }
    }

    fn set_state(&self, state: NegotiationState) {
        let prev = *self.state_tx.borrow();
        if prev != state {
            debug!(peer = %self.peer_id.short(), "negotiation {prev} -> {state}");
        }
        self.state_tx.send_replace(state);
    }
}
