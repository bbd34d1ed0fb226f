//! Per-viewer WebRTC peer connection state machine.
//!
//! States: Idle -> Negotiating -> Connected -> (Disconnected | Failed) ->
//! Terminated. Each viewer owns exactly one `PeerConnection` and one local
//! RTP track, from construction through `close()`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::mdns::{default_mdns_host_name, mdns_mode};
use super::packetizer::RtpPacketizer;
use super::signaling::{ConnectionState, IceCandidateInit};
use crate::error::{AppError, Result};

/// Events a peer connection raises toward the viewer's owning task (signaling
/// hub), which forwards them over that viewer's WebSocket.
#[derive(Debug)]
pub enum PeerEvent {
    IceCandidate(IceCandidateInit),
}

fn h264_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: super::packetizer::H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1".to_string(),
        rtcp_feedback: vec![
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: "".to_string(),
            },
            RTCPFeedback {
                typ: "nack".to_string(),
                parameter: "pli".to_string(),
            },
            RTCPFeedback {
                typ: "ccm".to_string(),
                parameter: "fir".to_string(),
            },
            RTCPFeedback {
                typ: "goog-remb".to_string(),
                parameter: "".to_string(),
            },
            RTCPFeedback {
                typ: "transport-cc".to_string(),
                parameter: "".to_string(),
            },
        ],
    }
}

/// Per-viewer WebRTC peer connection plus the RTP packetizer feeding its
/// local track.
pub struct PeerConnection {
    pub client_id: String,
    pc: Arc<RTCPeerConnection>,
    packetizer: Mutex<RtpPacketizer>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl PeerConnection {
    /// Build a peer connection and its local send-only video track. The
    /// connection starts in `Idle`; call `handle_offer` to move it to
    /// `Negotiating`.
    pub async fn new(
        config: &WebRtcConfig,
        client_id: String,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        let capability = h264_codec_capability();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: capability.clone(),
                    payload_type: super::packetizer::RTP_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| AppError::Negotiation(format!("failed to register H264 codec: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::Negotiation(format!("failed to register interceptors: {e}")))?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(default_mdns_host_name(&client_id));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![config.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::Negotiation(format!("failed to create peer connection: {e}"))
        })?);

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            "video".to_string(),
            format!("viewer-{client_id}"),
        ));

        let rtp_sender = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Negotiation(format!("failed to add video track: {e}")))?;

        // The SSRC is assigned at the sender when the track is added; we
        // must packetize with that value, not one of our own choosing, or
        // the browser has no m-line to associate packets with.
        let ssrc = rtp_sender
            .get_parameters()
            .await
            .encodings
            .first()
            .map(|e| e.ssrc)
            .ok_or_else(|| {
                AppError::Negotiation("RTCRtpSender negotiated no SSRC encoding".to_string())
            })?;

        // Drain RTCP (NACK/PLI/REMB) so the sender's internal buffers don't
        // back up; we don't currently act on the feedback.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let state_tx = Arc::new(state_tx);

        let peer = Self {
            client_id: client_id.clone(),
            pc: pc.clone(),
            packetizer: Mutex::new(RtpPacketizer::new(track, config.mtu, ssrc)),
            state_tx: state_tx.clone(),
            state_rx,
        };

        peer.install_handlers(events, config.ice_disconnect_grace, client_id);
        Ok(peer)
    }

    fn install_handlers(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
        grace: Duration,
        client_id: String,
    ) {
        let state_tx = self.state_tx.clone();
        let cid = client_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let state_tx = state_tx.clone();
                let cid = cid.clone();
                Box::pin(async move {
                    let mapped = match s {
                        RTCIceConnectionState::Checking => Some(ConnectionState::Negotiating),
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                            Some(ConnectionState::Connected)
                        }
                        RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
                        RTCIceConnectionState::Closed => Some(ConnectionState::Terminated),
                        _ => None,
                    };
                    if let Some(new_state) = mapped {
                        info!(client_id = %cid, state = %new_state, "ICE connection state changed");
                        let _ = state_tx.send(new_state);
                    }
                })
            }));

        // ICE-disconnect grace period: a transient network blip gets
        // `grace` to recover before the peer is moved to Failed.
        let grace_rx = self.state_rx.clone();
        let state_tx_grace = self.state_tx.clone();
        tokio::spawn(watch_disconnect_grace(
            grace_rx,
            state_tx_grace,
            grace,
            client_id.clone(),
        ));

        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let Ok(json) = candidate.to_json() else { return };
                    debug!("gathered ICE candidate: {}", json.candidate);
                    let _ = events.send(PeerEvent::IceCandidate(IceCandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: None,
                    }));
                })
            }));
    }

    /// Handle an SDP offer, returning the SDP answer. Moves the connection
    /// into `Negotiating`.
    pub async fn handle_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| AppError::Negotiation(format!("invalid SDP offer: {e}")))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::Negotiation(format!("set_remote_description failed: {e}")))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("create_answer failed: {e}")))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::Negotiation(format!("set_local_description failed: {e}")))?;

        let _ = self.state_tx.send(ConnectionState::Negotiating);
        Ok(answer.sdp)
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Negotiation(format!("add_ice_candidate failed: {e}")))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Write one NAL unit for this viewer specifically -- each viewer has
    /// its own SPS/PPS cache and sequence-number/SSRC state, so a slow or
    /// newly joined viewer never corrupts another's stream.
    pub async fn write_nal(&self, nal: &bytes::Bytes, timestamp: u32, is_last: bool) -> Result<()> {
        self.packetizer
            .lock()
            .await
            .write_nal(nal, timestamp, is_last)
            .await
    }

    pub async fn seed_parameter_sets(&self, sps: Option<bytes::Bytes>, pps: Option<bytes::Bytes>) {
        self.packetizer.lock().await.seed_parameter_sets(sps, pps);
    }

    pub async fn close(&self) -> Result<()> {
        let _ = self.state_tx.send(ConnectionState::Terminated);
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("failed to close peer connection: {e}")))
    }
}

/// Watches `rx` for a transition to `Disconnected`; if it hasn't changed
/// again within `grace`, sends `Failed` through `tx`. Exits when the
/// channel closes. Free-standing (rather than a method) so it can be driven
/// against a bare `watch::channel` in tests, without a real peer connection.
async fn watch_disconnect_grace(
    mut rx: watch::Receiver<ConnectionState>,
    tx: Arc<watch::Sender<ConnectionState>>,
    grace: Duration,
    client_id: String,
) {
    loop {
        if rx.changed().await.is_err() {
            return;
        }
        if *rx.borrow() != ConnectionState::Disconnected {
            continue;
        }
        let deadline_state = *rx.borrow();
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                if *rx.borrow() == deadline_state {
                    warn!(client_id = %client_id, "ICE disconnect grace period elapsed, failing peer");
                    let _ = tx.send(ConnectionState::Failed);
                }
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_codec_capability_matches_required_profile() {
        let cap = h264_codec_capability();
        assert_eq!(cap.mime_type, "video/H264");
        assert_eq!(cap.clock_rate, 90_000);
        assert!(cap.sdp_fmtp_line.contains("packetization-mode=1"));

        let feedback: Vec<(&str, &str)> = cap
            .rtcp_feedback
            .iter()
            .map(|f| (f.typ.as_str(), f.parameter.as_str()))
            .collect();
        assert!(feedback.contains(&("nack", "")));
        assert!(feedback.contains(&("nack", "pli")));
        assert!(feedback.contains(&("ccm", "fir")));
        assert!(feedback.contains(&("goog-remb", "")));
        assert!(feedback.contains(&("transport-cc", "")));
    }

    #[tokio::test]
    async fn recovering_before_grace_does_not_fail_the_peer() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let tx = Arc::new(tx);
        let grace = Duration::from_millis(60);
        let handle = tokio::spawn(watch_disconnect_grace(
            rx.clone(),
            tx.clone(),
            grace,
            "viewer-1".to_string(),
        ));

        tx.send(ConnectionState::Disconnected).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(ConnectionState::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*rx.borrow(), ConnectionState::Connected);
        handle.abort();
    }

    #[tokio::test]
    async fn disconnect_past_grace_fails_the_peer() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let tx = Arc::new(tx);
        let grace = Duration::from_millis(40);
        let handle = tokio::spawn(watch_disconnect_grace(
            rx.clone(),
            tx.clone(),
            grace,
            "viewer-1".to_string(),
        ));

        tx.send(ConnectionState::Disconnected).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(*rx.borrow(), ConnectionState::Failed);
        handle.abort();
    }
}
