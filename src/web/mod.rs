//! HTTP/WebSocket surface: the viewer page and the signaling endpoint.

mod routes;
mod static_files;
mod ws;

pub use routes::create_router;
pub use ws::ws_handler;
