use std::fmt::Debug;

pub type FrameId = u64;

/// Victim selection policy for unpinned page frames.
pub trait Replacer: Send + Sync + Debug {
    /// Select a frame to evict and forget it. Returns None if every frame is
    /// pinned.
    fn evict(&mut self) -> Option<FrameId>;

    /// Mark a frame as pinned (not evictable).
    fn pin(&mut self, frame_id: FrameId);

    /// Mark a frame as unpinned (evictable). Unpinning counts as an access.
    fn unpin(&mut self, frame_id: FrameId);

    /// Forget a frame that left the cache without being evicted.
    fn remove(&mut self, frame_id: FrameId) {
        self.pin(frame_id);
    }

    /// Get the number of evictable frames.
    fn size(&self) -> usize;
}
