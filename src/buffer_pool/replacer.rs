use super::FrameId;
use hashlink::LinkedHashMap;
use parking_lot::Mutex;

/// Eviction policy over unpinned frames. Implementations serialize their
/// own state so the pool can share them across its latch boundary.
pub(super) trait Replacer: Send + Sync {
    /// Removes and returns the frame that should be evicted next, if any.
    fn victim(&self) -> Option<FrameId>;
    /// Removes a frame from consideration; no-op when absent.
    fn pin(&self, frame_id: FrameId);
    /// Makes a frame eligible for eviction. Idempotent: a frame already
    /// queued keeps its position, tolerating repeated unpins by the pool.
    fn unpin(&self, frame_id: FrameId);
    fn size(&self) -> usize;
}

/// Least-recently-unpinned eviction. The linked hash map gives O(1)
/// append, removal, and front-pop, standing in for the classic
/// list-plus-position-map pair.
pub(super) struct LruReplacer {
    frames: Mutex<LinkedHashMap<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(LinkedHashMap::with_capacity(capacity)),
        }
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.frames.lock().pop_front().map(|(frame_id, ())| frame_id)
    }

    fn pin(&self, frame_id: FrameId) {
        self.frames.lock().remove(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut frames = self.frames.lock();
        if !frames.contains_key(&frame_id) {
            frames.insert(frame_id, ());
        }
    }

    fn size(&self) -> usize {
        self.frames.lock().len()
    }
}
