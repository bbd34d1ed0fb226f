//! Annex-B NAL unit splitter.
//!
//! Scans an append-only byte stream for start code prefixes (`00 00 01` or
//! `00 00 00 01`) and emits the NAL unit between consecutive prefixes.
//! Tolerates a start code straddling two `feed()` calls by re-scanning the
//! trailing run of zero bytes on the next call instead of re-scanning the
//! whole buffer.

use bytes::Bytes;

/// Incremental Annex-B splitter. Feed it chunks as they arrive from the
/// encoder; it emits whatever complete NAL units those chunks resolve.
#[derive(Debug, Default)]
pub struct NalSplitter {
    buf: Vec<u8>,
    /// Index into `buf` before which no start code has been found; bytes
    /// before this point are confirmed to belong to the in-progress NAL.
    scanned: usize,
    /// Whether a start code has ever been seen (bytes before the first one
    /// are not a NAL and are discarded).
    started: bool,
}

impl NalSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of encoder bytes, returning the NAL units (header byte
    /// included, start code stripped) that became complete as a result.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match find_prefix(&self.buf, self.scanned) {
                Some((prefix_start, prefix_len)) => {
                    if !self.started {
                        self.started = true;
                        self.buf.drain(0..prefix_start + prefix_len);
                        self.scanned = 0;
                        continue;
                    }
                    if prefix_start > 0 {
                        out.push(Bytes::copy_from_slice(&self.buf[..prefix_start]));
                    }
                    self.buf.drain(0..prefix_start + prefix_len);
                    self.scanned = 0;
                }
                None => {
                    let trailing_zeros = self.buf.iter().rev().take_while(|&&b| b == 0).count();
                    self.scanned = self.buf.len() - trailing_zeros;
                    break;
                }
            }
        }

        out
    }

    /// Flush whatever NAL is still pending (stream ended / process exited).
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.started && !self.buf.is_empty() {
            Some(Bytes::from(std::mem::take(&mut self.buf)))
        } else {
            None
        }
    }
}

/// Find the next start code at or after `from`. Returns (prefix_start,
/// prefix_length) where prefix_length is 3 or 4 (or more, for encoders that
/// pad extra zero bytes).
fn find_prefix(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut zeros = 0usize;
    for (i, &b) in data.iter().enumerate().skip(from) {
        match b {
            0 => zeros += 1,
            1 if zeros >= 2 => return Some((i - zeros, zeros + 1)),
            _ => zeros = 0,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[test]
    fn splits_mixed_3_and_4_byte_prefixes() {
        let mut s = NalSplitter::new();
        let stream = [
            &[0x00, 0x00, 0x00, 0x01][..],
            &[0x67, 0x42, 0x00, 0x1f][..], // SPS, 4-byte prefix
            &[0x00, 0x00, 0x01][..],
            &[0x68, 0xce, 0x3c, 0x80][..], // PPS, 3-byte prefix
            &[0x00, 0x00, 0x00, 0x01][..],
            &[0x65, 0x88, 0x84, 0x21][..], // IDR, 4-byte prefix
        ]
        .concat();

        let nals = s.feed(&stream);
        // last NAL is only flushed on `finish`, since a splitter cannot know
        // an append-only stream has ended until told so.
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], nal(&[0x67, 0x42, 0x00, 0x1f]));
        assert_eq!(nals[1], nal(&[0x68, 0xce, 0x3c, 0x80]));

        let last = s.finish().unwrap();
        assert_eq!(last, nal(&[0x65, 0x88, 0x84, 0x21]));
    }

    #[test]
    fn retains_start_code_straddling_two_feeds() {
        let full = [
            &[0x00, 0x00, 0x00, 0x01][..],
            &[0x67, 0xaa, 0xbb][..],
            &[0x00, 0x00, 0x01][..],
            &[0x68, 0xcc][..],
        ]
        .concat();

        // Split the stream at every possible offset and confirm the result
        // is independent of how the bytes were chunked.
        for split in 0..=full.len() {
            let mut s = NalSplitter::new();
            let mut nals = s.feed(&full[..split]);
            nals.extend(s.feed(&full[split..]));
            if let Some(last) = s.finish() {
                nals.push(last);
            }
            assert_eq!(nals, vec![nal(&[0x67, 0xaa, 0xbb]), nal(&[0x68, 0xcc])]);
        }
    }

    #[test]
    fn skips_empty_nal_between_adjacent_prefixes() {
        let mut s = NalSplitter::new();
        let stream = [
            &[0x00, 0x00, 0x01][..],
            &[0x00, 0x00, 0x01][..], // back-to-back prefix, zero-length NAL in between
            &[0x65, 0x01][..],
        ]
        .concat();
        let mut nals = s.feed(&stream);
        if let Some(last) = s.finish() {
            nals.push(last);
        }
        assert_eq!(nals, vec![nal(&[0x65, 0x01])]);
    }

    #[test]
    fn discards_leading_garbage_before_first_start_code() {
        let mut s = NalSplitter::new();
        let stream = [
            &[0xff, 0xff, 0x00][..], // garbage, no valid prefix yet
            &[0x00, 0x00, 0x01][..],
            &[0x65, 0x01][..],
        ]
        .concat();
        let mut nals = s.feed(&stream);
        if let Some(last) = s.finish() {
            nals.push(last);
        }
        assert_eq!(nals, vec![nal(&[0x65, 0x01])]);
    }
}
