mod config;
mod server;
mod sse;
mod ws;

pub use config::ProxyConfig;
pub use server::ProxyServer;
pub use sse::render_sse_event;
