use super::registry::{MemoryEntry, PendingFree};
use super::{MemDesc, ProcessStats, Sharedmem};
use crate::kgsl::timestamp::{Timestamp, TimestampType};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Entries whose release waits on the GPU, oldest first.
///
/// The queue is kept in non-decreasing timestamp order (modulo wraparound), so draining only
/// ever has to look at the head.
#[derive(Debug, Default)]
pub struct MemQueue {
    entries: VecDeque<MemoryEntry>,
}

impl MemQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The timestamp of the most recently queued entry.
    #[must_use]
    pub fn tail_timestamp(&self) -> Option<Timestamp> {
        self.entries
            .back()
            .and_then(|e| e.pending_free)
            .map(|p| p.timestamp)
    }

    /// Would an entry freed on `timestamp` keep the queue ordered?
    #[must_use]
    pub fn accepts(&self, timestamp: Timestamp) -> bool {
        self.tail_timestamp()
            .is_none_or(|tail| timestamp.reached(tail))
    }

    /// Appends `entry` to be destroyed once `timestamp` retires.
    ///
    /// An entry whose timestamp is older than the current tail would break the ordering the
    /// drain relies on; it is handed back untouched.
    pub fn enqueue(
        &mut self,
        mut entry: MemoryEntry,
        timestamp: Timestamp,
        kind: TimestampType,
    ) -> Result<(), MemoryEntry> {
        if !self.accepts(timestamp) {
            return Err(entry);
        }
        entry.pending_free = Some(PendingFree { timestamp, kind });
        self.entries.push_back(entry);
        Ok(())
    }

    /// Destroys every entry at the head whose timestamp `retired` has reached.
    ///
    /// Returns the number destroyed. Draining twice with the same value is a no-op the
    /// second time.
    pub fn drain(&mut self, retired: Timestamp, mem: &Sharedmem) -> usize {
        let mut freed = 0;
        while self
            .entries
            .front()
            .and_then(|e| e.pending_free)
            .is_some_and(|p| retired.reached(p.timestamp))
        {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            entry.destroy(mem);
            freed += 1;
        }
        if freed > 0 {
            debug!("memqueue drained {freed} entries at retired timestamp {retired}");
        }
        freed
    }

    /// Destroys every queued entry of one process regardless of its timestamp.
    pub fn cleanup(&mut self, owner: &Arc<ProcessStats>, mem: &Sharedmem) -> usize {
        let (dying, keep): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.owned_by(owner));
        self.entries = keep;

        let count = dying.len();
        for entry in dying {
            entry.destroy(mem);
        }
        count
    }

    /// Finds the queued region containing `gpuaddr`.
    #[must_use]
    pub fn find(&self, gpuaddr: u32) -> Option<&MemDesc> {
        self.entries
            .iter()
            .map(|e| &e.memdesc)
            .find(|d| d.contains(gpuaddr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
