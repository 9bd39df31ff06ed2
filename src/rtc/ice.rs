//! Buffering for ICE candidates that arrive before a remote description

use std::collections::HashMap;

use super::types::{IceCandidateInit, PeerId};

/// Candidates that cannot be applied yet because the peer has no remote
/// description. Drained in arrival order exactly once, right after a remote
/// offer or answer is applied.
#[derive(Default)]
pub struct IceBuffer {
    queued: HashMap<PeerId, Vec<IceCandidateInit>>,
}

impl IceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, peer: &PeerId, candidate: IceCandidateInit) {
        self.queued.entry(peer.clone()).or_default().push(candidate);
    }

    /// Takes everything queued for `peer`, in arrival order.
    pub fn drain(&mut self, peer: &PeerId) -> Vec<IceCandidateInit> {
        self.queued.remove(peer).unwrap_or_default()
    }

    /// Drops any queued candidates for a departed peer.
    pub fn purge(&mut self, peer: &PeerId) {
        self.queued.remove(peer);
    }

    pub fn queued_len(&self, peer: &PeerId) -> usize {
        self.queued.get(peer).map(Vec::len).unwrap_or(0)
    }
}

/// Candidates the local stack can never use: empty placeholders and
/// unresolved mDNS `.local` addresses. Dropped instead of buffered so they
/// don't turn into failed-apply noise later.
pub fn looks_unusable(candidate: &IceCandidateInit) -> bool {
    candidate.candidate.is_empty() || candidate.candidate.contains(".local")
}
