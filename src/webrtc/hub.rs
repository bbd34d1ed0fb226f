//! Signaling hub: the single owner of all live peer connections.
//!
//! One task owns the peer map and drains a single command channel
//! (register/unregister/dispatch/snapshot/peer-closed), rather than sharing
//! it behind a lock: a single owner needs no lock and cannot deadlock
//! against a viewer holding one across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use super::config::WebRtcConfig;
use super::peer::{PeerConnection, PeerEvent};
use super::signaling::{ConnectionState, Envelope, KIND_ICE_CANDIDATE, KIND_OFFER, KIND_STOP};
use crate::error::Result;

enum Command {
    Register {
        client_id: String,
        outbound: mpsc::UnboundedSender<Envelope>,
    },
    Unregister {
        client_id: String,
    },
    Dispatch(Envelope),
    Snapshot(oneshot::Sender<Vec<Arc<PeerConnection>>>),
    /// A peer's own ICE-state watcher observed Failed or Terminated; remove
    /// it from the room so the fan-out stops writing to it.
    PeerClosed {
        client_id: String,
    },
}

/// Cheaply cloneable handle to the running hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl HubHandle {
    /// Register a new viewer connection, returning the channel the caller
    /// (the WebSocket handler) must drain and forward to the browser.
    pub fn register(&self, client_id: String) -> mpsc::UnboundedReceiver<Envelope> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(Command::Register {
            client_id,
            outbound: outbound_tx,
        });
        outbound_rx
    }

    pub fn unregister(&self, client_id: String) {
        let _ = self.tx.send(Command::Unregister { client_id });
    }

    /// Hand an incoming WebSocket envelope to the hub for processing.
    pub fn dispatch(&self, envelope: Envelope) {
        let _ = self.tx.send(Command::Dispatch(envelope));
    }

    /// Snapshot of currently live peer connections, used by the fan-out
    /// scheduler to know which viewers to write RTP to.
    pub async fn peers(&self) -> Vec<Arc<PeerConnection>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Owns every live [`PeerConnection`] and drives signaling for all of them.
/// Run `Hub::run` in its own task; communicate with it only through
/// [`HubHandle`].
pub struct Hub {
    config: WebRtcConfig,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    peers: HashMap<String, Arc<PeerConnection>>,
    outbounds: HashMap<String, mpsc::UnboundedSender<Envelope>>,
}

impl Hub {
    pub fn new(config: WebRtcConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            config,
            tx: tx.clone(),
            rx,
            peers: HashMap::new(),
            outbounds: HashMap::new(),
        };
        (hub, HubHandle { tx })
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Register {
                    client_id,
                    outbound,
                } => {
                    info!(client_id = %client_id, "viewer registered");
                    self.outbounds.insert(client_id, outbound);
                }
                Command::Unregister { client_id } => {
                    info!(client_id = %client_id, "viewer unregistered");
                    self.outbounds.remove(&client_id);
                    if let Some(peer) = self.peers.remove(&client_id) {
                        if let Err(e) = peer.close().await {
                            warn!(client_id = %client_id, error = %e, "error closing peer on unregister");
                        }
                    }
                }
                Command::Dispatch(envelope) => {
                    if let Err(e) = self.handle_envelope(envelope).await {
                        error!(error = %e, "error handling signaling envelope");
                    }
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(
                        self.peers
                            .values()
                            .filter(|p| p.state() == ConnectionState::Connected)
                            .cloned()
                            .collect(),
                    );
                }
                Command::PeerClosed { client_id } => {
                    if let Some(peer) = self.peers.remove(&client_id) {
                        info!(client_id = %client_id, state = %peer.state(), "peer left the room");
                    }
                }
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        let client_id = envelope.client_id.clone();
        let Some(outbound) = self.outbounds.get(&client_id).cloned() else {
            warn!(client_id = %client_id, "envelope for unknown client, dropping");
            return Ok(());
        };

        match envelope.kind {
            KIND_OFFER => {
                let Some(offer) = envelope.offer else {
                    return Ok(());
                };

                // A second OFFER for an ID already in the room replaces the
                // first, after cleanly closing it.
                if let Some(old) = self.peers.remove(&client_id) {
                    info!(client_id = %client_id, "replacing existing peer connection for new OFFER");
                    if let Err(e) = old.close().await {
                        warn!(client_id = %client_id, error = %e, "error closing replaced peer");
                    }
                }

                let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PeerEvent>();
                let peer = Arc::new(
                    PeerConnection::new(&self.config, client_id.clone(), event_tx).await?,
                );

                let forward_outbound = outbound.clone();
                let forward_client_id = client_id.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        let PeerEvent::IceCandidate(candidate) = event;
                        let env = Envelope::ice_candidate(forward_client_id.clone(), candidate);
                        if forward_outbound.send(env).is_err() {
                            return;
                        }
                    }
                });

                // Watch this peer's own state machine so a Failed/Terminated
                // transition (e.g. the ICE-disconnect grace timeout) removes
                // it from the room even with no further signaling traffic.
                let mut watch_rx = peer.state_watch();
                let watch_tx = self.tx.clone();
                let watch_client_id = client_id.clone();
                tokio::spawn(async move {
                    while watch_rx.changed().await.is_ok() {
                        let state = *watch_rx.borrow();
                        if state == ConnectionState::Failed || state == ConnectionState::Terminated
                        {
                            let _ = watch_tx.send(Command::PeerClosed {
                                client_id: watch_client_id,
                            });
                            return;
                        }
                    }
                });

                let answer_sdp = peer.handle_offer(offer.sdp).await?;
                self.peers.insert(client_id.clone(), peer);
                let _ = outbound.send(Envelope::answer(client_id, answer_sdp));
            }
            KIND_ICE_CANDIDATE => {
                let Some(candidate) = envelope.client_ice_candidate else {
                    return Ok(());
                };
                if let Some(peer) = self.peers.get(&client_id) {
                    peer.add_ice_candidate(candidate).await?;
                } else {
                    warn!(client_id = %client_id, "ICE candidate for unknown peer, dropping");
                }
            }
            KIND_STOP => {
                if let Some(peer) = self.peers.remove(&client_id) {
                    peer.close().await?;
                }
            }
            other => {
                warn!(client_id = %client_id, kind = other, "unrecognized envelope kind");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::signaling::IceCandidateInit;
    use std::time::Duration;

    fn test_config() -> WebRtcConfig {
        WebRtcConfig {
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            mtu: 1200,
            ice_disconnect_grace: Duration::from_secs(10),
        }
    }

    fn registered_hub(client_id: &str) -> (Hub, mpsc::UnboundedReceiver<Envelope>) {
        let (mut hub, _handle) = Hub::new(test_config());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        hub.outbounds.insert(client_id.to_string(), outbound_tx);
        (hub, outbound_rx)
    }

    #[tokio::test]
    async fn envelope_for_unregistered_client_is_a_no_op() {
        let (mut hub, _handle) = Hub::new(test_config());
        let result = hub
            .handle_envelope(Envelope::stop("nobody-registered"))
            .await;
        assert!(result.is_ok());
        assert!(hub.peers.is_empty());
    }

    #[tokio::test]
    async fn ice_candidate_for_registered_client_with_no_peer_is_a_no_op() {
        let (mut hub, _rx) = registered_hub("viewer-1");
        let candidate = IceCandidateInit {
            candidate: "candidate:1 1 UDP 1 127.0.0.1 1 typ host".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        let mut envelope = Envelope::stop("viewer-1");
        envelope.kind = KIND_ICE_CANDIDATE;
        envelope.client_ice_candidate = Some(candidate);

        let result = hub.handle_envelope(envelope).await;
        assert!(result.is_ok());
        assert!(hub.peers.is_empty());
    }

    #[tokio::test]
    async fn stop_for_registered_client_with_no_peer_is_a_no_op() {
        let (mut hub, _rx) = registered_hub("viewer-1");
        let result = hub.handle_envelope(Envelope::stop("viewer-1")).await;
        assert!(result.is_ok());
        assert!(hub.peers.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_empty_with_no_peers() {
        let (hub, handle) = Hub::new(test_config());
        tokio::spawn(hub.run());
        assert!(handle.peers().await.is_empty());
    }
}
