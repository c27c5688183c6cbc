use super::replacer::{FrameId, Replacer};
use std::collections::{BTreeMap, HashMap};

/// Least-recently-unpinned replacer.
///
/// Each evictable frame carries the tick of its last unpin; the frame with
/// the smallest tick is the victim.
#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Evictable frames ordered by last access tick.
    by_tick: BTreeMap<u64, FrameId>,
    /// Last access tick of each evictable frame.
    ticks: HashMap<FrameId, u64>,
    clock: u64,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_tick: BTreeMap::new(),
            ticks: HashMap::with_capacity(capacity),
            clock: 0,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        let (_, frame_id) = self.by_tick.pop_first()?;
        self.ticks.remove(&frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if let Some(tick) = self.ticks.remove(&frame_id) {
            self.by_tick.remove(&tick);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        self.pin(frame_id);
        self.clock += 1;
        self.by_tick.insert(self.clock, frame_id);
        self.ticks.insert(frame_id, self.clock);
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }
}
