//! Partitioning of an event sequence into transmission-sized chunks.
//!
//! Pure function over already-sized events: greedy, order-preserving, bounded
//! by both a byte and a count budget per chunk. A single event larger than
//! the byte budget still ships alone in its own chunk; surfacing a delivery
//! failure for it is the transmission client's job, not the chunker's.

use crate::buffer::QueuedEvent;
use crate::retry::RetryItem;

/// Byte and count limits for one chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkBudget {
    pub max_bytes: usize,
    pub max_events: usize,
}

/// Anything with a known serialized size, so fresh and retried events chunk
/// through the same code path.
pub trait PayloadSized {
    fn payload_size(&self) -> usize;
}

impl PayloadSized for QueuedEvent {
    fn payload_size(&self) -> usize {
        self.size
    }
}

impl PayloadSized for RetryItem {
    fn payload_size(&self) -> usize {
        self.size
    }
}

/// Greedily partitions `events` into chunks honoring `budget`.
///
/// Concatenating the returned chunks reproduces the input order exactly.
pub fn chunk_events<T: PayloadSized>(events: Vec<T>, budget: ChunkBudget) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_bytes = 0;

    for event in events {
        let size = event.payload_size();
        let overflows_bytes = !current.is_empty() && current_bytes + size > budget.max_bytes;
        let overflows_count = current.len() >= budget.max_events;
        if overflows_bytes || overflows_count {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(event);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
