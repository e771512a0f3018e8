//! The logical transmission channel seam.
//!
//! The exchanger owns exactly one [`Transmission`] at a time and talks to
//! it purely in [`LinkMessage`]s; framing, encryption and the socket itself
//! live in the collaborator that drains the message receiver. A dropped
//! receiver is how channel loss shows up here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::LinkMessage;

/// Outbound handle for one logical transmission.
///
/// Cheap to clone; all clones share the channel and the generation number.
/// The generation distinguishes a fresh transmission from a stale one after
/// a reconnect, so table entries bound to a dead channel can be recognized.
#[derive(Debug, Clone)]
pub struct Transmission {
    generation: u64,
    sender: mpsc::UnboundedSender<LinkMessage>,
}

impl Transmission {
    /// Send a message toward the remote peer. Returns false once the
    /// collaborator has hung up (dead channel).
    pub fn send(&self, message: LinkMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Whether the collaborator is still draining this channel.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Create a transmission plus the receiver its collaborator drains.
pub fn channel_pair(generation: u64) -> (Transmission, mpsc::UnboundedReceiver<LinkMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        Transmission {
            generation,
            sender,
        },
        receiver,
    )
}

/// Opens transmissions on demand for the exchanger: once at `open()` and
/// again from the Reconnecting state after channel loss.
pub trait TransmissionConnector: Send + Sync {
    /// Establish a new transmission, or `None` when the remote peer is
    /// unreachable right now.
    fn open_transmission(&self) -> Option<Transmission>;
}

/// Connector that hands out channel-backed transmissions and parks the
/// receive halves for the caller to drain. Used by tests and by dry-run
/// mode in the binary; a wire collaborator provides the real one.
#[derive(Debug, Default)]
pub struct ChannelConnector {
    next_generation: AtomicU64,
    receivers: std::sync::Mutex<Vec<mpsc::UnboundedReceiver<LinkMessage>>>,
}

impl ChannelConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the receive half of the most recently opened transmission.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<LinkMessage>> {
        self.receivers.lock().expect("connector poisoned").pop()
    }

    /// How many transmissions have been opened so far.
    pub fn opened(&self) -> u64 {
        self.next_generation.load(Ordering::SeqCst)
    }
}

impl TransmissionConnector for ChannelConnector {
    fn open_transmission(&self) -> Option<Transmission> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (transmission, receiver) = channel_pair(generation);
        self.receivers
            .lock()
            .expect("connector poisoned")
            .push(receiver);
        Some(transmission)
    }
}
