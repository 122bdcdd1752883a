//! Telephony media streaming leg: wire codec and socket ownership.

pub mod messages;
pub mod transport;

pub use messages::{OutboundMessage, TelephonyMessage, Timestamp};
pub use transport::{SendErrorClass, SinkCommand, TelephonySink, classify_send_error};
