//! Transport boundary.
//!
//! The overlay does not care how messages reach the wire. A transport only
//! has to accept outgoing messages and hand back a token identifying each
//! send; incoming messages and acknowledgements are pushed into the
//! [`Proxy`](crate::proxy::Proxy) by whoever drives the transport.

pub mod loopback;
pub mod message;

pub use loopback::LoopbackTransport;
pub use message::{Direction, Message};

use crate::utils::Result;

/// Outgoing side of a messaging channel
pub trait Transport: Send {
    /// Send a message to the peer, returning a token for acknowledgement
    ///
    /// # Errors
    ///
    /// Returns an error when the channel cannot accept the message
    fn send(&mut self, message: &Message) -> Result<String>;
}
