//! HTTP and WebSocket request handlers
//!
//! - `calls` - health endpoints, inbound-call webhook, call-automation callbacks
//! - `media` - the media streaming WebSocket that runs one bridge per call

pub mod calls;
pub mod media;
