pub mod audio;
pub mod bridge;
pub mod calls;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod telephony;

// Re-export commonly used items for convenience
pub use bridge::{Bridge, BridgeConfig};
pub use config::ServerConfig;
pub use errors::{BridgeError, BridgeResult};
pub use state::AppState;
