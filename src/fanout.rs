//! Fan-out scheduler: reads Annex-B bytes from the encoder, splits them into
//! NAL units, and writes each one to every connected viewer through its own
//! bounded queue.
//!
//! A bounded `mpsc` per viewer plus a per-viewer drop counter is used rather
//! than a single shared broadcast channel, which would evict the oldest
//! unread message for *every* subscriber the moment any one of them falls
//! behind. Here a slow viewer only ever loses its own frames.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::h264::NalSplitter;
use crate::webrtc::{ticks_per_frame, HubHandle, PeerConnection};

const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_PPS: u8 = 8;
const NALU_TYPE_IDR: u8 = 5;
const READ_CHUNK: usize = 64 * 1024;

struct QueueItem {
    nal: Bytes,
    timestamp: u32,
    is_last_nal_of_au: bool,
}

/// Per-viewer delivery state: a bounded queue plus the drop counter exposed
/// to diagnostics for that viewer specifically.
struct Viewer {
    tx: mpsc::Sender<QueueItem>,
    dropped: Arc<AtomicU64>,
    /// True until this viewer's first IDR has been forwarded. A viewer
    /// attached mid-stream drops every non-parameter-set, non-IDR NAL until
    /// its first IDR arrives, so it never starts mid-access-unit on a
    /// non-key frame.
    waiting_for_idr: bool,
}

/// Classify a NAL type and deliver it to every viewer not currently waiting
/// for its first IDR, enqueuing a clone onto each viewer's bounded queue and
/// counting a drop for that viewer alone if the queue is full. Returns
/// whether this NAL was a VCL slice (and therefore advances the clock).
///
/// Free-standing so the per-viewer idr-gating and isolation behavior can be
/// exercised directly in tests without a running encoder stream or hub.
fn dispatch_nal(
    viewers: &mut HashMap<String, Viewer>,
    nal: &Bytes,
    nal_type: u8,
    timestamp: u32,
) -> bool {
    let is_parameter_set = nal_type == NALU_TYPE_SPS || nal_type == NALU_TYPE_PPS;
    let is_idr = nal_type == NALU_TYPE_IDR;
    // Baseline-profile encoders emit one slice per access unit; each VCL
    // NAL therefore both starts and completes its AU, which is what sets
    // the RTP marker bit and advances the 90kHz clock.
    let is_vcl = (1..=5).contains(&nal_type);

    for viewer in viewers.values_mut() {
        if viewer.waiting_for_idr {
            if is_idr {
                viewer.waiting_for_idr = false;
            } else if !is_parameter_set {
                continue;
            }
        }

        let item = QueueItem {
            nal: nal.clone(),
            timestamp,
            is_last_nal_of_au: is_vcl,
        };
        if viewer.tx.try_send(item).is_err() {
            viewer.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    is_vcl
}

/// Drains one encoder byte stream and distributes RTP-ready NAL units to
/// every peer currently registered with the signaling hub.
pub struct Fanout {
    hub: HubHandle,
    queue_capacity: usize,
    frame_period_ms: u64,
    /// Only start draining the encoder once at least one viewer is
    /// connected; used for file-backed sources that would otherwise be
    /// consumed before anyone is watching.
    wait_for_viewer: bool,
}

impl Fanout {
    pub fn new(hub: HubHandle, queue_capacity: usize, frame_period_ms: u64, wait_for_viewer: bool) -> Self {
        Self {
            hub,
            queue_capacity,
            frame_period_ms,
            wait_for_viewer,
        }
    }

    /// Run the fan-out loop to completion (until the encoder stream ends).
    pub async fn run(&self, mut reader: impl AsyncRead + Unpin) -> Result<()> {
        let mut splitter = NalSplitter::new();
        let tick = ticks_per_frame(self.frame_period_ms);
        let mut timestamp: u32 = 0;
        let mut viewers: HashMap<String, Viewer> = HashMap::new();
        let mut cached_sps: Option<Bytes> = None;
        let mut cached_pps: Option<Bytes> = None;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            if self.wait_for_viewer {
                while self.hub.peers().await.is_empty() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }

            let n = reader.read(&mut buf).await?;
            if n == 0 {
                debug!("encoder stream ended");
                break;
            }

            let nals = splitter.feed(&buf[..n]);
            if nals.is_empty() {
                continue;
            }

            self.sync_viewers(&mut viewers, cached_sps.clone(), cached_pps.clone())
                .await;

            for nal in nals {
                if nal.is_empty() {
                    continue;
                }
                let nal_type = nal[0] & 0x1F;
                if nal_type == NALU_TYPE_SPS {
                    cached_sps = Some(nal.clone());
                }
                if nal_type == NALU_TYPE_PPS {
                    cached_pps = Some(nal.clone());
                }

                let is_vcl = dispatch_nal(&mut viewers, &nal, nal_type, timestamp);
                if is_vcl {
                    timestamp = timestamp.wrapping_add(tick);
                }
            }
        }

        if let Some(last) = splitter.finish() {
            for viewer in viewers.values() {
                let _ = viewer.tx.try_send(QueueItem {
                    nal: last.clone(),
                    timestamp,
                    is_last_nal_of_au: true,
                });
            }
        }

        Ok(())
    }

    /// Reconcile the worker map against the hub's current peer set (the hub
    /// only ever returns peers in the Connected state, so a viewer still
    /// negotiating or already Failed/Terminated never gets a writer): spawn
    /// a writer task for newly connected viewers (seeding cached SPS/PPS so
    /// a viewer joining mid-stream still gets parameter sets with its first
    /// access unit) and drop workers for viewers the hub no longer has.
    ///
    /// A genuinely on-demand key frame for new joiners would need a control
    /// channel back to the encoder, which this system does not have; a new
    /// viewer instead waits for the encoder's next periodic IDR (see
    /// `Viewer::waiting_for_idr`).
    async fn sync_viewers(
        &self,
        viewers: &mut HashMap<String, Viewer>,
        cached_sps: Option<Bytes>,
        cached_pps: Option<Bytes>,
    ) {
        let current = self.hub.peers().await;
        let current_ids: HashSet<String> = current.iter().map(|p| p.client_id.clone()).collect();
        viewers.retain(|id, viewer| {
            let keep = current_ids.contains(id);
            if !keep {
                debug!(
                    client_id = %id,
                    dropped = viewer.dropped.load(Ordering::Relaxed),
                    "fan-out detaching viewer"
                );
            }
            keep
        });

        for peer in current {
            if viewers.contains_key(&peer.client_id) {
                continue;
            }
            info!(client_id = %peer.client_id, "fan-out attaching viewer");
            peer.seed_parameter_sets(cached_sps.clone(), cached_pps.clone())
                .await;

            let (tx, mut rx) = mpsc::channel::<QueueItem>(self.queue_capacity);
            let dropped = Arc::new(AtomicU64::new(0));
            let worker_peer: Arc<PeerConnection> = peer;
            let client_id = worker_peer.client_id.clone();
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    if let Err(e) = worker_peer
                        .write_nal(&item.nal, item.timestamp, item.is_last_nal_of_au)
                        .await
                    {
                        warn!(client_id = %client_id, error = %e, "RTP write failed, dropping viewer worker");
                        return;
                    }
                }
            });

            viewers.insert(
                client_id,
                Viewer {
                    tx,
                    dropped,
                    waiting_for_idr: true,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_viewer(viewers: &mut HashMap<String, Viewer>, id: &str, capacity: usize) -> Arc<AtomicU64> {
        let (tx, rx) = mpsc::channel(capacity);
        std::mem::forget(rx); // keep the channel open without a draining task
        let dropped = Arc::new(AtomicU64::new(0));
        viewers.insert(
            id.to_string(),
            Viewer {
                tx,
                dropped: dropped.clone(),
                waiting_for_idr: true,
            },
        );
        dropped
    }

    #[test]
    fn new_viewer_drops_leading_non_idr_slices_until_first_idr() {
        let mut viewers = HashMap::new();
        add_viewer(&mut viewers, "v1", 8);

        // A non-IDR slice (type 1) before any IDR is dropped...
        assert!(dispatch_nal(&mut viewers, &Bytes::from_static(&[0x01]), 1, 0));
        assert_eq!(viewers["v1"].dropped.load(Ordering::Relaxed), 0);
        assert!(viewers["v1"].waiting_for_idr);

        // ...but an SPS/PPS while still waiting is still delivered...
        assert!(!dispatch_nal(&mut viewers, &Bytes::from_static(&[0x07]), 7, 0));
        assert!(viewers["v1"].waiting_for_idr);

        // ...and the first IDR clears the wait and is delivered.
        assert!(dispatch_nal(&mut viewers, &Bytes::from_static(&[0x05]), 5, 3000));
        assert!(!viewers["v1"].waiting_for_idr);

        // Subsequent non-IDR slices are now delivered normally.
        assert!(dispatch_nal(&mut viewers, &Bytes::from_static(&[0x01]), 1, 6000));
    }

    #[test]
    fn fan_out_isolates_a_blocked_viewer() {
        let mut viewers = HashMap::new();
        // "a" has ample queue room (never fills in this test); "b" has a
        // single slot and is never drained, simulating a stalled sink.
        let dropped_a = add_viewer(&mut viewers, "a", 10);
        let dropped_b = add_viewer(&mut viewers, "b", 1);

        // Clear the idr wait for both so every NAL after this is counted.
        dispatch_nal(&mut viewers, &Bytes::from_static(&[0x05]), 5, 0);
        assert_eq!(dropped_a.load(Ordering::Relaxed), 0);
        assert_eq!(dropped_b.load(Ordering::Relaxed), 0);

        for i in 0..5u32 {
            dispatch_nal(&mut viewers, &Bytes::from_static(&[0x01]), 1, 3000 * (i + 1));
        }

        assert_eq!(dropped_a.load(Ordering::Relaxed), 0);
        assert!(dropped_b.load(Ordering::Relaxed) > 0);
    }
}
