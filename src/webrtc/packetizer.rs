//! RTP packetizer: wraps RFC-6184 payloads (from [`crate::h264::payloader`])
//! with an RTP header and writes them to a viewer's track.
//!
//! One instance is owned by each viewer, mirroring the reference encoder's
//! per-client `Packetizer` + `Track.WriteRTP()` pairing rather than a
//! shared packetizer fed from one place -- the original's `client.go`
//! creates a fresh `rtp.Packetizer` per client for exactly this reason.

use std::sync::Arc;

use rand::Rng;
use rtp::header::Header;
use rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::error::{AppError, Result};
use crate::h264::H264Payloader;

/// H.264 clock rate, fixed by RFC 6184.
pub const H264_CLOCK_RATE: u32 = 90_000;
pub const RTP_PAYLOAD_TYPE: u8 = 96;

/// Per-viewer RTP state: random initial sequence number and SSRC, a
/// monotonically wrapping sequence counter, and the payloader that turns
/// NAL units into RFC-6184 payloads for this viewer specifically.
pub struct RtpPacketizer {
    track: Arc<TrackLocalStaticRTP>,
    payloader: H264Payloader,
    ssrc: u32,
    sequence_number: u16,
    mtu: usize,
}

impl RtpPacketizer {
    /// `ssrc` must be the value negotiated for this track's `RTCRtpSender`
    /// (read back via `get_parameters().encodings[0].ssrc` after
    /// `add_track`), not an independently chosen one: `TrackLocalStaticRTP`
    /// does not rewrite the SSRC on outgoing packets, so a mismatch here
    /// means the browser silently drops every packet as unassociated with
    /// the negotiated m-line. webrtc-rs assigns that SSRC randomly itself,
    /// which is what satisfies "a random SSRC per track" in practice.
    pub fn new(track: Arc<TrackLocalStaticRTP>, mtu: usize, ssrc: u32) -> Self {
        Self {
            track,
            payloader: H264Payloader::new(),
            ssrc,
            sequence_number: rand::thread_rng().gen(),
            mtu,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Seed the payloader's SPS/PPS cache, used when this viewer joins
    /// mid-stream so its first STAP-A still carries the parameter sets.
    pub fn seed_parameter_sets(&mut self, sps: Option<bytes::Bytes>, pps: Option<bytes::Bytes>) {
        self.payloader.seed(sps, pps);
    }

    /// Packetize one NAL unit belonging to an access unit timestamped at
    /// `timestamp` (90kHz ticks) and write each resulting RTP packet to the
    /// viewer's track. `is_last_nal_of_au` controls the marker bit on the
    /// final packet produced from this NAL.
    pub async fn write_nal(
        &mut self,
        nal: &bytes::Bytes,
        timestamp: u32,
        is_last_nal_of_au: bool,
    ) -> Result<()> {
        let payloads = self.payloader.payload(self.mtu, nal);
        let last_index = payloads.len().saturating_sub(1);

        for (i, payload) in payloads.into_iter().enumerate() {
            let marker = is_last_nal_of_au && i == last_index;
            let header = Header {
                version: 2,
                padding: false,
                extension: false,
                marker,
                payload_type: RTP_PAYLOAD_TYPE,
                sequence_number: self.sequence_number,
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);

            let packet = Packet { header, payload };
            self.track
                .write_rtp(&packet)
                .await
                .map_err(|e| AppError::Transport(format!("RTP write failed: {e}")))?;
        }

        Ok(())
    }
}

/// Map a frame period (milliseconds) to its 90kHz tick duration, used by the
/// fan-out scheduler to advance the access-unit timestamp each frame. A
/// truncated wall-clock timestamp wraps unpredictably inside a 32-bit field
/// and doesn't track actual frame cadence, so the clock is derived from the
/// configured frame period instead.
pub fn ticks_per_frame(frame_period_ms: u64) -> u32 {
    ((frame_period_ms as u64 * H264_CLOCK_RATE as u64) / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_per_frame_at_30fps() {
        assert_eq!(ticks_per_frame(33), 2970);
    }
}
