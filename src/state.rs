//! Application-wide shared state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::settings::Settings;
use crate::webrtc::HubHandle;

/// Shared across all HTTP/WebSocket handlers.
pub struct AppState {
    pub settings: Settings,
    pub hub: HubHandle,
    /// Fanned out from the supervisor to every task (HTTP server, fan-out
    /// loop, per-viewer WebSocket handler) so a single cancel() unwinds the
    /// whole process without each task polling a separate channel.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(settings: Settings, hub: HubHandle, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            settings,
            hub,
            shutdown,
        })
    }

    /// A child token a handler can `.cancelled().await` on; cancelling it
    /// locally never propagates back up to the parent.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
