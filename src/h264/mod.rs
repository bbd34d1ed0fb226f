//! H.264 Annex-B parsing and RFC 6184 RTP payload construction.
//!
//! This is the byte-level front half of the pipeline: raw encoder bytes go
//! in, RFC-6184 payloads (still unaware of RTP sequence/timestamp/SSRC) come
//! out. The packetizer in [`crate::webrtc::packetizer`] wraps these payloads
//! with RTP headers per viewer.

pub mod nal;
pub mod payloader;

pub use nal::NalSplitter;
pub use payloader::H264Payloader;
