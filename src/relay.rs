use crossbeam_channel::{Receiver, Sender, bounded};

use crate::models::RawPosting;

/// Default mailbox capacity. Keeps memory bounded when scraping outruns
/// scoring: a full queue blocks the collector instead of buffering.
pub const DEFAULT_CAPACITY: usize = 50;

/// Value carried by the relay queue. Termination is an explicit variant
/// rather than a null-ish posting, so sparse posting fields can never be
/// mistaken for end-of-stream.
#[derive(Debug, Clone)]
pub enum Envelope {
    Posting(RawPosting),
    Shutdown,
}

pub type RelaySender = Sender<Envelope>;
pub type RelayReceiver = Receiver<Envelope>;

/// A fixed-capacity FIFO mailbox between the collector and the scoring
/// workers. `send` blocks while full, `recv` blocks while empty. FIFO
/// ordering means a worker can never observe `Shutdown` ahead of a
/// posting enqueued before it.
pub fn channel(capacity: usize) -> (RelaySender, RelayReceiver) {
    bounded(capacity)
}
