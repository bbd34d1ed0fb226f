//! Wire format for the WebSocket signaling channel between a browser
//! viewer and its peer connection, and in-process connection state.

use serde::{Deserialize, Serialize};

pub const KIND_OFFER: u8 = 0;
pub const KIND_ANSWER: u8 = 1;
pub const KIND_ICE_CANDIDATE: u8 = 2;
pub const KIND_STOP: u8 = 3;

/// An SDP offer or answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// A trickle-ICE candidate, shaped to match
/// `webrtc::ice_transport::ice_candidate::RTCIceCandidateInit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// The JSON envelope exchanged on `/ws?clientID=<id>`, in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub client_id: String,
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Server -> client trickle candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<IceCandidateInit>,
    /// Client -> server trickle candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ice_candidate: Option<IceCandidateInit>,
}

impl Envelope {
    pub fn offer(client_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            kind: KIND_OFFER,
            offer: Some(SessionDescription { sdp: sdp.into() }),
            ..Default::default()
        }
    }

    pub fn answer(client_id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            kind: KIND_ANSWER,
            answer: Some(SessionDescription { sdp: sdp.into() }),
            ..Default::default()
        }
    }

    pub fn ice_candidate(client_id: impl Into<String>, candidate: IceCandidateInit) -> Self {
        Self {
            client_id: client_id.into(),
            kind: KIND_ICE_CANDIDATE,
            ice_candidate: Some(candidate),
            ..Default::default()
        }
    }

    pub fn stop(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            kind: KIND_STOP,
            ..Default::default()
        }
    }
}

/// Peer connection lifecycle state, driven by ICE connection state changes
/// plus the fan-out's own grace-period and termination logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Terminated,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::offer("viewer-1", "v=0...");
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.client_id, "viewer-1");
        assert_eq!(parsed.kind, KIND_OFFER);
        assert_eq!(parsed.offer.unwrap().sdp, "v=0...");
    }
}
