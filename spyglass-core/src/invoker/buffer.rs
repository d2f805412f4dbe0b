use super::{BufferLimits, BufferStats, ReceivedMessage};
use std::collections::VecDeque;

/// Keeps the most recent messages of a stream.
///
/// Sequence numbers are assigned on push and are contiguous, so the oldest retained
/// message always has `seq == total - visible`.
#[derive(Debug)]
pub(crate) struct MessageBuffer {
    limits: BufferLimits,
    entries: VecDeque<ReceivedMessage>,
    total: u64,
}

impl MessageBuffer {
    pub(crate) fn new(limits: BufferLimits) -> Self {
        let capacity = limits.capacity.max(1);
        let evict_batch = limits.evict_batch.clamp(1, capacity);
        Self {
            limits: BufferLimits {
                capacity,
                evict_batch,
            },
            entries: VecDeque::new(),
            total: 0,
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.total
    }

    /// Appends `message`, evicting the oldest batch first when full.
    pub(crate) fn push(&mut self, message: ReceivedMessage) {
        if self.entries.len() >= self.limits.capacity {
            let evict = self.limits.evict_batch.min(self.entries.len());
            self.entries.drain(..evict);
        }
        self.entries.push_back(message);
        self.total += 1;
    }

    /// The first retained message with `seq >= cursor`.
    pub(crate) fn next_from(&self, cursor: u64) -> Option<&ReceivedMessage> {
        let first = self.total - self.entries.len() as u64;
        let index = cursor.saturating_sub(first);
        usize::try_from(index).ok().and_then(|i| self.entries.get(i))
    }

    pub(crate) fn stats(&self) -> BufferStats {
        let visible = self.entries.len();
        BufferStats {
            visible,
            total: self.total,
            truncated: (visible as u64) < self.total,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ReceivedMessage> {
        self.entries.iter().cloned().collect()
    }
}
