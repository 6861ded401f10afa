//! In-process transport for tests and the demo.
//!
//! Two [`LoopbackTransport`]s created by [`LoopbackTransport::pair`] deliver
//! into each other's inbox channel. Nothing leaves the process.

use crate::transport::{Direction, Message, Transport};
use crate::utils::{Result, SessionError};
use tokio::sync::mpsc;

/// One end of an in-process channel
#[derive(Debug)]
pub struct LoopbackTransport {
    local_id: String,
    peer: mpsc::UnboundedSender<Message>,
    sent: u64,
}

/// Receiving half belonging to a [`LoopbackTransport`]
pub type LoopbackInbox = mpsc::UnboundedReceiver<Message>;

impl LoopbackTransport {
    /// Create two connected ends. Each returned inbox receives what the
    /// *other* end sends.
    pub fn pair(a: &str, b: &str) -> ((Self, LoopbackInbox), (Self, LoopbackInbox)) {
        let (to_b, b_inbox) = mpsc::unbounded_channel();
        let (to_a, a_inbox) = mpsc::unbounded_channel();

        let a_end = Self {
            local_id: a.to_string(),
            peer: to_b,
            sent: 0,
        };
        let b_end = Self {
            local_id: b.to_string(),
            peer: to_a,
            sent: 0,
        };
        ((a_end, a_inbox), (b_end, b_inbox))
    }

    /// Name of this end
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Number of messages sent so far
    pub fn sent_count(&self) -> u64 {
        self.sent
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, message: &Message) -> Result<String> {
        let mut delivered = message.clone();
        delivered.direction = Direction::FromPeer;
        delivered.encrypted = false;

        self.peer.send(delivered).map_err(|_| SessionError::Transport {
            reason: format!("peer of {} hung up", self.local_id),
        })?;
        self.sent += 1;

        log::trace!("{} sent message {}", self.local_id, message.id);
        Ok(format!("{}-{}", self.local_id, self.sent))
    }
}
