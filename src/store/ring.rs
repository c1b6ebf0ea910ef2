use std::collections::VecDeque;
use std::sync::Mutex;

use crate::store::FrameStore;
use crate::types::entities::FrameEntry;

/// In-process frame buffer: a mutex-guarded ring holding the `capacity` most
/// recent entries, newest first. Readers and the single producer may run
/// concurrently; every observer sees either the pre- or post-push state.
pub struct RingFrameStore {
    capacity: usize,
    entries: Mutex<VecDeque<FrameEntry>>,
}

impl RingFrameStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingFrameStore {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }
}

impl FrameStore for RingFrameStore {
    fn push(&self, entry: FrameEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    fn peek(&self) -> Option<FrameEntry> {
        self.entries.lock().unwrap().front().cloned()
    }

    fn get(&self, n: usize) -> Option<Vec<FrameEntry>> {
        if n == 0 {
            return None;
        }
        let entries = self.entries.lock().unwrap();
        if entries.len() < n {
            return None;
        }
        Some(entries.iter().take(n).cloned().collect())
    }

    fn range(&self, n: usize) -> (usize, Vec<FrameEntry>) {
        let entries = self.entries.lock().unwrap();
        (entries.len(), entries.iter().take(n).cloned().collect())
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn destroy(&self) {
        self.entries.lock().unwrap().clear();
    }
}
