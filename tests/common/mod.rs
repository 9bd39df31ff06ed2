//! Scriptable in-memory transport for exercising the negotiation machinery
//! without a network stack.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use callmesh::rtc::{
    IceCandidateInit, PeerId, PeerTransport, SdpKind, SessionDescription, TransportEvent,
    TransportFactory,
};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MockState {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<Option<IceCandidateInit>>,
    pub rollbacks: usize,
    pub audio_attached: bool,
    pub audio_replacements: usize,
}

pub struct MockTransport {
    pub state: Mutex<MockState>,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn offers(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<Option<IceCandidateInit>> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn audio_attached(&self) -> bool {
        self.state.lock().unwrap().audio_attached
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        let suffix = if ice_restart { "-restart" } else { "" };
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("offer-{n}{suffix}"),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let n = self.answers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("answer-{n}"),
        })
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.state.lock().unwrap().local = Some(desc.clone());
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.state.lock().unwrap().remote = Some(desc.clone());
        Ok(())
    }

    async fn rollback_local(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.rollbacks += 1;
        state.local = None;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Option<IceCandidateInit>) -> Result<()> {
        self.state.lock().unwrap().candidates.push(candidate);
        Ok(())
    }

    async fn attach_outbound_audio(&self) -> Result<()> {
        self.state.lock().unwrap().audio_attached = true;
        Ok(())
    }

    async fn replace_outbound_audio(&self) -> Result<()> {
        self.state.lock().unwrap().audio_replacements += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type CreatedEntry = (Arc<MockTransport>, mpsc::Sender<(PeerId, TransportEvent)>);

/// Factory that remembers every transport it built, so tests can inspect
/// them and inject transport events.
pub struct MockFactory {
    created: Mutex<HashMap<PeerId, CreatedEntry>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: Mutex::new(HashMap::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn transport(&self, peer: &PeerId) -> Option<Arc<MockTransport>> {
        self.created.lock().unwrap().get(peer).map(|(t, _)| t.clone())
    }

    pub fn events_sender(&self, peer: &PeerId) -> Option<mpsc::Sender<(PeerId, TransportEvent)>> {
        self.created.lock().unwrap().get(peer).map(|(_, tx)| tx.clone())
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: mpsc::Sender<(PeerId, TransportEvent)>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = MockTransport::new();
        self.created
            .lock()
            .unwrap()
            .insert(peer.clone(), (transport.clone(), events));
        Ok(transport)
    }
}
