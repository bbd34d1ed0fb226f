//! RFC 6184 payload construction: single-NAL passthrough, STAP-A aggregation
//! of SPS/PPS, and FU-A fragmentation of oversized NALs.
//!
//! Mirrors the reference encoder's `Payload()` state machine: SPS and PPS
//! are cached rather than emitted directly, and are flushed as one STAP-A
//! the next time a non-parameter-set NAL arrives.

use bytes::{Bytes, BytesMut};

const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_PPS: u8 = 8;
const NALU_TYPE_AUD: u8 = 9;
const NALU_TYPE_FILL: u8 = 12;
const NALU_TYPE_FUA: u8 = 28;

/// F=0, NRI=3, type=24 (STAP-A).
const STAP_A_HEADER: u8 = 0x78;
const FUA_HEADER_SIZE: usize = 2;

/// Stateful H.264-to-RFC6184 payloader. One instance per viewer: each
/// viewer needs its own SPS/PPS cache so a late joiner gets parameter sets
/// re-aggregated with its own first access unit.
#[derive(Debug, Default)]
pub struct H264Payloader {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl H264Payloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the cached SPS/PPS, used when a viewer joins mid-stream and
    /// needs the parameter sets held by the fan-out's parser state.
    pub fn seed(&mut self, sps: Option<Bytes>, pps: Option<Bytes>) {
        self.sps = sps;
        self.pps = pps;
    }

    /// Convert one NAL unit into zero or more RTP payloads for the given
    /// MTU. SPS/PPS NALs are cached and produce no payload on their own.
    pub fn payload(&mut self, mtu: usize, nal: &Bytes) -> Vec<Bytes> {
        if nal.is_empty() {
            return Vec::new();
        }

        let header = nal[0];
        let nal_ref_idc = header & 0x60;
        let nal_type = header & 0x1F;

        if nal_type == NALU_TYPE_SPS {
            self.sps = Some(nal.clone());
            return Vec::new();
        }
        if nal_type == NALU_TYPE_PPS {
            self.pps = Some(nal.clone());
            return Vec::new();
        }
        if nal_type == NALU_TYPE_AUD || nal_type == NALU_TYPE_FILL {
            return Vec::new();
        }

        let mut payloads = Vec::new();

        if let (Some(sps), Some(pps)) = (self.sps.take(), self.pps.take()) {
            let agg_len = 1 + 2 + sps.len() + 2 + pps.len();
            if agg_len <= mtu {
                let mut buf = BytesMut::with_capacity(agg_len);
                buf.extend_from_slice(&[STAP_A_HEADER]);
                buf.extend_from_slice(&(sps.len() as u16).to_be_bytes());
                buf.extend_from_slice(&sps);
                buf.extend_from_slice(&(pps.len() as u16).to_be_bytes());
                buf.extend_from_slice(&pps);
                payloads.push(buf.freeze());
            }
            // Cleared unconditionally, matching the reference encoder: an
            // oversized aggregate is dropped rather than retried.
        }

        if nal.len() <= mtu {
            payloads.push(nal.clone());
            return payloads;
        }

        let max_fragment_size = mtu.saturating_sub(FUA_HEADER_SIZE);
        let body = nal.slice(1..);
        if max_fragment_size == 0 || body.is_empty() {
            return payloads;
        }

        let indicator = NALU_TYPE_FUA | nal_ref_idc;
        let mut offset = 0usize;
        while offset < body.len() {
            let end = (offset + max_fragment_size).min(body.len());
            let mut fu_header = nal_type;
            if offset == 0 {
                fu_header |= 0x80; // Start
            }
            if end == body.len() {
                fu_header |= 0x40; // End
            }

            let mut frag = BytesMut::with_capacity(FUA_HEADER_SIZE + (end - offset));
            frag.extend_from_slice(&[indicator, fu_header]);
            frag.extend_from_slice(&body[offset..end]);
            payloads.push(frag.freeze());

            offset = end;
        }

        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_nal_passthrough() {
        let mut p = H264Payloader::new();
        let nal = Bytes::from_static(&[0x65, 0x88, 0x84, 0x21]);
        let out = p.payload(1400, &nal);
        assert_eq!(out, vec![nal]);
    }

    #[test]
    fn stap_a_aggregates_sps_and_pps_then_clears() {
        let mut p = H264Payloader::new();
        let sps = Bytes::from_static(&[0x67, 0x42, 0x00, 0x1F]);
        let pps = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        let idr = Bytes::from_static(&[0x65, 0xB8]);

        assert!(p.payload(1400, &sps).is_empty());
        assert!(p.payload(1400, &pps).is_empty());

        let out = p.payload(1400, &idr);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0].as_ref(),
            &[0x78, 0x00, 0x04, 0x67, 0x42, 0x00, 0x1F, 0x00, 0x04, 0x68, 0xCE, 0x3C, 0x80][..]
        );
        assert_eq!(out[1], idr);

        // cleared: a second slice NAL must not re-emit a STAP-A
        let next = Bytes::from_static(&[0x61, 0x01]);
        let out2 = p.payload(1400, &next);
        assert_eq!(out2, vec![next]);
    }

    #[test]
    fn aud_and_filler_are_dropped() {
        let mut p = H264Payloader::new();
        assert!(p.payload(1400, &Bytes::from_static(&[0x09, 0xf0])).is_empty());
        assert!(p.payload(1400, &Bytes::from_static(&[0x0c])).is_empty());
    }

    #[test]
    fn fu_a_fragments_oversized_nal() {
        let mut p = H264Payloader::new();
        let mtu = 10usize;
        let mut data = vec![0x61u8]; // non-IDR slice, nal_ref_idc = 3 << 5 = 0x60
        data.extend(std::iter::repeat(0xAA).take(23));
        let nal = Bytes::from(data.clone());

        let out = p.payload(mtu, &nal);
        // max fragment body = mtu - 2 = 8; ceil(23/8) = 3 fragments: 8, 8, 7
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].len(), 10);
        assert_eq!(out[1].len(), 10);
        assert_eq!(out[2].len(), 9);

        let indicator = 0x60 | 28; // nal_ref_idc | FU-A type
        assert_eq!(out[0][0], indicator);
        assert_eq!(out[1][0], indicator);
        assert_eq!(out[2][0], indicator);

        assert_eq!(out[0][1], 0x01 | 0x80); // type=1, start
        assert_eq!(out[1][1], 0x01); // middle
        assert_eq!(out[2][1], 0x01 | 0x40); // end

        let mut reassembled = Vec::new();
        for frag in &out {
            reassembled.extend_from_slice(&frag[2..]);
        }
        assert_eq!(reassembled, data[1..]);
    }

    #[test]
    fn oversized_stap_a_is_dropped_but_state_still_clears() {
        let mut p = H264Payloader::new();
        let sps = Bytes::from(vec![0x67u8; 900]);
        let pps = Bytes::from(vec![0x68u8; 900]);
        let idr = Bytes::from_static(&[0x65, 0x01]);

        assert!(p.payload(1400, &sps).is_empty());
        assert!(p.payload(1400, &pps).is_empty());

        // aggregate would be 1 + 2 + 900 + 2 + 900 = 1805 > 1400 MTU
        let out = p.payload(1400, &idr);
        assert_eq!(out, vec![idr]);
    }
}
