//! WebRTC peer connection configuration, derived from [`crate::settings::Settings`].

use std::time::Duration;

/// Parameters the peer connection state machine needs per viewer. Built
/// once from `Settings` at startup and shared (by value) across viewers.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN server URL used for ICE gathering.
    pub stun_server: String,
    /// RTP payload MTU passed to the H.264 payloader.
    pub mtu: usize,
    /// How long a Disconnected peer is given to recover before it is
    /// failed.
    pub ice_disconnect_grace: Duration,
}

impl From<&crate::settings::Settings> for WebRtcConfig {
    fn from(settings: &crate::settings::Settings) -> Self {
        Self {
            stun_server: settings.stun_server.clone(),
            mtu: settings.mtu,
            ice_disconnect_grace: Duration::from_secs(settings.ice_disconnect_grace_secs),
        }
    }
}
