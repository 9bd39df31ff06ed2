//! Signaling wire types shared with the room relay

use serde::{Deserialize, Serialize};

/// Peer identifier issued by the relay at join time.
///
/// Opaque and totally ordered; the ordering is only ever used as a
/// deterministic tie-break between two peers, never as a trust signal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs, matching what the relay prints.
    pub fn short(&self) -> &str {
        self.0.get(..6).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Whether the local side is the *polite* half of a peer pair.
///
/// The side holding the larger id yields on offer glare. Derived purely from
/// the two ids so both sides agree without any coordination message.
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    local > remote
}

/// Whether the local side places the initial call to `remote`.
///
/// The smaller id calls; the other side waits for the offer. Either side may
/// still start a renegotiation later, with glare rules arbitrating.
pub fn initiates(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// One entry of the relay-maintained roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: PeerId,
    #[serde(default)]
    pub name: String,
}

/// Session description kind carried in `sdpType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// ICE candidate payload as it travels over the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// All signaling message types, tagged by `type`.
///
/// Addressed messages carry `to` outbound and arrive with `from` stamped by
/// the relay; broadcast/control messages carry neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "hello")]
    Hello {
        id: PeerId,
        #[serde(default)]
        roster: Vec<RosterEntry>,
    },
    #[serde(rename = "roster")]
    Roster {
        #[serde(default)]
        roster: Vec<RosterEntry>,
    },
    #[serde(rename = "peer-joined")]
    PeerJoined { id: PeerId },
    #[serde(rename = "peer-left")]
    PeerLeft { id: PeerId },
    #[serde(rename = "name")]
    Name { name: String },
    #[serde(rename = "offer")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        sdp: String,
        #[serde(rename = "sdpType")]
        sdp_type: SdpKind,
    },
    #[serde(rename = "answer")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        sdp: String,
        #[serde(rename = "sdpType")]
        sdp_type: SdpKind,
    },
    #[serde(rename = "ice")]
    Ice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        /// `None` is the end-of-candidates marker and is sent as JSON null.
        candidate: Option<IceCandidateInit>,
    },
    #[serde(rename = "key")]
    Key {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(rename = "pub")]
        public_key: String,
    },
    #[serde(rename = "chat-e2e")]
    ChatE2e {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        iv: String,
        ct: String,
        ts: u64,
    },
    #[serde(rename = "safety-ok")]
    SafetyOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
    },
    #[serde(rename = "full")]
    Full {
        #[serde(default)]
        capacity: Option<u32>,
    },
    #[serde(rename = "browser-only")]
    BrowserOnly {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl SignalMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalMessage::Hello { .. } => "hello",
            SignalMessage::Roster { .. } => "roster",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Name { .. } => "name",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Ice { .. } => "ice",
            SignalMessage::Key { .. } => "key",
            SignalMessage::ChatE2e { .. } => "chat-e2e",
            SignalMessage::SafetyOk { .. } => "safety-ok",
            SignalMessage::Full { .. } => "full",
            SignalMessage::BrowserOnly { .. } => "browser-only",
        }
    }

    /// Sender id stamped by the relay on addressed messages.
    pub fn from(&self) -> Option<&PeerId> {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Ice { from, .. }
            | SignalMessage::Key { from, .. }
            | SignalMessage::ChatE2e { from, .. }
            | SignalMessage::SafetyOk { from, .. } => from.as_ref(),
            _ => None,
        }
    }

    pub fn offer(to: &PeerId, sdp: String) -> Self {
        SignalMessage::Offer {
            to: Some(to.clone()),
            from: None,
            sdp,
            sdp_type: SdpKind::Offer,
        }
    }

    pub fn answer(to: &PeerId, sdp: String) -> Self {
        SignalMessage::Answer {
            to: Some(to.clone()),
            from: None,
            sdp,
            sdp_type: SdpKind::Answer,
        }
    }

    pub fn ice(to: &PeerId, candidate: Option<IceCandidateInit>) -> Self {
        SignalMessage::Ice {
            to: Some(to.clone()),
            from: None,
            candidate,
        }
    }

    pub fn key(to: &PeerId, public_key: String) -> Self {
        SignalMessage::Key {
            to: Some(to.clone()),
            from: None,
            public_key,
        }
    }
}
