mod frame;
pub mod parallel;
mod replacer;

use crate::disk_manager::DiskManager;
use crate::pages::{Page, PageId};
use anyhow::{anyhow, Result};
use frame::Frame;
use parking_lot::FairMutex;
use replacer::{LruReplacer, Replacer};
use std::collections::{HashMap, LinkedList};
use std::sync::Arc;
use tracing::trace;

pub type FrameId = usize;
pub type ArcBufferPool = Arc<FairMutex<BufferPoolManager>>;

/// Fixed-capacity page cache over a [`DiskManager`].
///
/// Owns `pool_size` frames, a page table mapping resident page ids to
/// frames, a free list, and an LRU replacer that tracks unpinned frames.
/// Shared behind a [`FairMutex`] ([`ArcBufferPool`]); every public
/// operation runs under that single latch for its full duration.
pub struct BufferPoolManager {
    disk_manager: DiskManager,

    free_frames: LinkedList<FrameId>,
    page_table: HashMap<PageId, FrameId>,
    frames: Vec<Frame>,

    replacer: Box<dyn Replacer>,

    next_page_id: PageId,
    num_instances: u32,
    instance_index: u32,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, path: &str) -> Self {
        Self::with_instance(pool_size, 1, 0, path)
    }

    /// Builds one instance of a striped pool: page ids minted here satisfy
    /// `page_id % num_instances == instance_index`, so sibling instances
    /// never collide without coordinating.
    pub fn with_instance(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        path: &str,
    ) -> Self {
        assert!(num_instances > 0, "a pool needs at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {instance_index} out of range for {num_instances} instances"
        );

        let frames = (0..pool_size).map(|_| Frame::new()).collect::<Vec<_>>();

        Self {
            disk_manager: DiskManager::new(path),
            free_frames: LinkedList::from_iter(0..pool_size),
            page_table: HashMap::new(),
            frames,
            replacer: Box::new(LruReplacer::new(pool_size)),
            next_page_id: instance_index as PageId,
            num_instances,
            instance_index,
        }
    }

    fn allocate_page(&mut self) -> PageId {
        let page_id = self.next_page_id;
        self.next_page_id += self.num_instances as PageId;
        debug_assert_eq!(
            page_id % self.num_instances as PageId,
            self.instance_index as PageId
        );
        page_id
    }

    /// Free frames are preferred over eviction so warm-up never writes.
    fn find_free_frame(&mut self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_frames.pop_front() {
            return Ok(frame_id);
        }
        if self.replacer.size() == 0 {
            return Err(anyhow!("no free frames to evict"));
        }
        let frame_id = self
            .replacer
            .victim()
            .expect("non-empty replacer yields a victim");
        self.evict_frame(frame_id)?;
        Ok(frame_id)
    }

    fn evict_frame(&mut self, frame_id: FrameId) -> Result<()> {
        let frame = &mut self.frames[frame_id];
        assert_eq!(frame.get_pin_count(), 0);

        let page = frame.writer();
        self.page_table.remove(&page.get_page_id());

        trace!(
            page_id = page.get_page_id(),
            dirty = page.is_dirty(),
            "evicting page"
        );
        if page.is_dirty() {
            if let Err(e) = self.disk_manager.write_page(page) {
                // the page is already out of the table; hand the frame to
                // the free list so a failed write cannot leak it
                self.free_frames.push_back(frame_id);
                return Err(e);
            }
            page.mark_clean();
        }

        Ok(())
    }

    /// Mints a fresh page id and pins a zeroed page for it.
    ///
    /// Fails only when every frame is pinned; the page id sequence is not
    /// advanced in that case. The empty page is written through so a later
    /// clean eviction can always be re-fetched.
    pub fn new_page(&mut self) -> Result<&mut Frame> {
        let frame_id = self.find_free_frame()?;
        let page_id = self.allocate_page();

        let mut page = Page::new();
        page.set_page_id(page_id);
        self.disk_manager.write_page(&page)?;

        trace!(page_id, frame_id, "created page");

        let frame = &mut self.frames[frame_id];
        frame.set_page(page);
        frame.pin();
        self.page_table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Pins the requested page, reading it from disk on a miss.
    pub fn fetch_frame(&mut self, page_id: PageId) -> Result<&mut Frame> {
        let frame_id = if let Some(frame_id) = self.page_table.get(&page_id) {
            *frame_id
        } else {
            let page = self.disk_manager.read_page(page_id)?;
            let frame_id = self.find_free_frame()?;

            self.frames[frame_id].set_page(page);
            self.page_table.insert(page_id, frame_id);

            frame_id
        };

        let frame = &mut self.frames[frame_id];
        frame.pin();
        self.replacer.pin(frame_id);

        trace!(
            page_id,
            pin_count = frame.get_pin_count(),
            "fetched page"
        );

        Ok(frame)
    }

    /// Drops one pin, OR-ing in the caller's dirty flag. Returns false for
    /// a page that is not resident or not pinned; the pin count saturates
    /// at zero rather than underflowing on unbalanced unpins.
    pub fn unpin(&mut self, page_id: &PageId, is_dirty: bool) -> bool {
        let Some(&frame_id) = self.page_table.get(page_id) else {
            return false;
        };

        let frame = &mut self.frames[frame_id];
        if frame.get_pin_count() == 0 {
            return false;
        }

        if is_dirty {
            frame.writer().mark_dirty();
        }
        frame.unpin();

        trace!(
            page_id = *page_id,
            pin_count = frame.get_pin_count(),
            "unpinned page"
        );

        if frame.get_pin_count() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Writes a resident dirty page through to disk. The dirty flag stays
    /// set: eviction rewrites the bytes, trading a redundant write for a
    /// simpler protocol.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return Ok(false);
        };

        let page = self.frames[frame_id].reader();
        if page.is_dirty() {
            self.disk_manager.write_page(page)?;
        }
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        for &frame_id in self.page_table.values() {
            let page = self.frames[frame_id].reader();
            if page.is_dirty() {
                self.disk_manager.write_page(page)?;
            }
        }
        Ok(())
    }

    /// Evicts a page for good. `Ok(true)` when the page is absent or
    /// successfully deleted, `Ok(false)` while anyone still pins it.
    pub fn delete_page(&mut self, page_id: PageId) -> Result<bool> {
        let Some(&frame_id) = self.page_table.get(&page_id) else {
            return Ok(true);
        };

        if self.frames[frame_id].get_pin_count() != 0 {
            return Ok(false);
        }

        let page = self.frames[frame_id].reader();
        if page.is_dirty() {
            self.disk_manager.write_page(page)?;
        }

        self.frames[frame_id].set_page(Page::new());
        self.page_table.remove(&page_id);
        self.free_frames.push_back(frame_id);
        // the frame must not linger in the replacer queue
        self.replacer.pin(frame_id);
        self.disk_manager.deallocate_page(page_id);

        trace!(page_id, frame_id, "deleted page");

        Ok(true)
    }

    #[cfg(test)]
    pub fn get_pin_count(&self, page_id: &PageId) -> Option<u16> {
        let frame_id = *self.page_table.get(page_id)?;
        Some(self.frames[frame_id].get_pin_count())
    }

    #[cfg(test)]
    pub fn is_page_dirty(&self, page_id: &PageId) -> Option<bool> {
        let frame_id = *self.page_table.get(page_id)?;
        Some(self.frames[frame_id].reader().is_dirty())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::disk_manager::test_path;
    use anyhow::Result;

    pub(crate) fn test_arc_bpm(size: usize) -> ArcBufferPool {
        Arc::new(FairMutex::new(BufferPoolManager::new(size, &test_path())))
    }

    #[test]
    fn test_dont_evict_pinned() -> Result<()> {
        let mut bpm = BufferPoolManager::new(2, &test_path());

        let p1 = bpm.new_page()?.reader().get_page_id();
        let p2 = bpm.new_page()?.reader().get_page_id();

        assert!(bpm.new_page().is_err());

        bpm.unpin(&p1, false);
        assert!(bpm.new_page().is_ok());

        // p2 is still pinned, and the third page holds the other frame
        assert_eq!(bpm.get_pin_count(&p2), Some(1));
        assert!(bpm.new_page().is_err());

        Ok(())
    }

    #[test]
    fn test_eviction_order_and_dirty_writeback() -> Result<()> {
        let mut bpm = BufferPoolManager::new(3, &test_path());

        let p0 = bpm.new_page()?.reader().get_page_id();
        let p1 = bpm.new_page()?.reader().get_page_id();
        let _p2 = bpm.new_page()?.reader().get_page_id();

        bpm.fetch_frame(p0)?.writer().write_bytes(0, 4, &[9, 9, 9, 9]);
        bpm.unpin(&p0, true);
        bpm.unpin(&p0, true);
        bpm.unpin(&p1, false);

        // all frames occupied; p0 is the least recently unpinned
        let p3 = bpm.new_page()?.reader().get_page_id();
        assert!(bpm.get_pin_count(&p0).is_none());
        assert_eq!(bpm.get_pin_count(&p3), Some(1));

        // fetching p0 back evicts p1 (clean, no write) and reads the
        // flushed bytes from disk
        let frame = bpm.fetch_frame(p0)?;
        assert_eq!(frame.reader().read_bytes(0, 4), [9, 9, 9, 9]);
        assert!(bpm.get_pin_count(&p1).is_none());

        Ok(())
    }

    #[test]
    fn test_unpin_saturates_at_zero() -> Result<()> {
        let mut bpm = BufferPoolManager::new(2, &test_path());

        let p1 = bpm.new_page()?.reader().get_page_id();

        assert!(bpm.unpin(&p1, false));
        assert!(!bpm.unpin(&p1, false));
        assert_eq!(bpm.get_pin_count(&p1), Some(0));

        assert!(!bpm.unpin(&999, false));

        Ok(())
    }

    #[test]
    fn test_flush_keeps_dirty_flag() -> Result<()> {
        let mut bpm = BufferPoolManager::new(2, &test_path());

        let p1 = bpm.new_page()?.reader().get_page_id();
        bpm.unpin(&p1, true);

        assert!(bpm.flush_page(p1)?);
        assert_eq!(bpm.is_page_dirty(&p1), Some(true));

        assert!(!bpm.flush_page(999)?);

        bpm.flush_all_pages()?;
        assert_eq!(bpm.is_page_dirty(&p1), Some(true));

        Ok(())
    }

    #[test]
    fn test_delete_page_requires_zero_pins() -> Result<()> {
        let mut bpm = BufferPoolManager::new(2, &test_path());

        let p1 = bpm.new_page()?.reader().get_page_id();

        assert!(!bpm.delete_page(p1)?);

        bpm.unpin(&p1, true);
        assert!(bpm.delete_page(p1)?);
        assert!(bpm.get_pin_count(&p1).is_none());

        // deleting an absent page reports success
        assert!(bpm.delete_page(p1)?);

        // the freed frame is reusable without eviction
        bpm.new_page()?;
        bpm.new_page()?;
        Ok(())
    }

    #[test]
    fn test_striped_page_id_allocation() -> Result<()> {
        let mut bpm = BufferPoolManager::with_instance(5, 4, 2, &test_path());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = bpm.new_page()?.reader().get_page_id();
            bpm.unpin(&id, false);
            ids.push(id);
        }

        assert_eq!(ids, vec![2, 6, 10]);

        Ok(())
    }
}
