pub mod bucket;

use crate::latch::Latch;
use crate::pages::{Page, PageId, INVALID_PAGE, PAGE_SIZE};
use std::collections::HashMap;
use std::sync::Arc;

/// Most hash bits a directory can consume; the slot arrays are sized for
/// the worst case so the on-page record never moves.
pub const MAX_DEPTH: u32 = 9;
pub const DIRECTORY_ARRAY_SIZE: usize = 1 << MAX_DEPTH;

/// On-page record of the directory. Overlaid on the page buffer, so field
/// order and types are the wire format (native byte order).
#[repr(C)]
pub struct DirectoryPageData {
    page_id: PageId,
    global_depth: u32,
    bucket_page_ids: [PageId; DIRECTORY_ARRAY_SIZE],
    local_depths: [u8; DIRECTORY_ARRAY_SIZE],
}

/// Typed view over a pinned directory page. The raw pointer stays valid
/// while the pin is held; views never outlive their fetch/unpin cycle.
pub struct DirectoryPage {
    data: *mut DirectoryPageData,
    page_id: PageId,
    latch: Arc<Latch>,
}

impl<'a> From<&'a mut Page> for DirectoryPage {
    fn from(page: &'a mut Page) -> DirectoryPage {
        assert!(std::mem::size_of::<DirectoryPageData>() <= PAGE_SIZE);
        DirectoryPage {
            data: page.data.as_mut_ptr() as *mut DirectoryPageData,
            page_id: page.get_page_id(),
            latch: page.latch.clone(),
        }
    }
}

impl DirectoryPage {
    fn data(&self) -> &DirectoryPageData {
        unsafe { self.data.as_ref().unwrap() }
    }

    fn data_mut(&mut self) -> &mut DirectoryPageData {
        unsafe { self.data.as_mut().unwrap() }
    }

    /// Prepares a freshly allocated page: depth zero, every slot vacant.
    pub fn init(&mut self, page_id: PageId) {
        let data = self.data_mut();
        data.page_id = page_id;
        data.global_depth = 0;
        data.bucket_page_ids = [INVALID_PAGE; DIRECTORY_ARRAY_SIZE];
        data.local_depths = [0; DIRECTORY_ARRAY_SIZE];
    }

    pub fn get_page_id(&self) -> PageId {
        self.page_id
    }

    pub fn get_latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    pub fn global_depth(&self) -> u32 {
        self.data().global_depth
    }

    pub fn global_depth_mask(&self) -> u32 {
        (1 << self.data().global_depth) - 1
    }

    pub fn incr_global_depth(&mut self) {
        assert!(self.data().global_depth < MAX_DEPTH);
        self.data_mut().global_depth += 1;
    }

    pub fn decr_global_depth(&mut self) {
        assert!(self.data().global_depth > 0);
        self.data_mut().global_depth -= 1;
    }

    /// Live directory size: `2^global_depth` slots.
    pub fn size(&self) -> usize {
        1 << self.data().global_depth
    }

    pub fn bucket_page_id(&self, index: usize) -> PageId {
        self.data().bucket_page_ids[index]
    }

    pub fn set_bucket_page_id(&mut self, index: usize, page_id: PageId) {
        self.data_mut().bucket_page_ids[index] = page_id;
    }

    pub fn local_depth(&self, index: usize) -> u32 {
        self.data().local_depths[index] as u32
    }

    pub fn set_local_depth(&mut self, index: usize, depth: u32) {
        debug_assert!(depth <= MAX_DEPTH);
        self.data_mut().local_depths[index] = depth as u8;
    }

    pub fn incr_local_depth(&mut self, index: usize) {
        let depth = self.local_depth(index);
        self.set_local_depth(index, depth + 1);
    }

    pub fn decr_local_depth(&mut self, index: usize) {
        let depth = self.local_depth(index);
        assert!(depth > 0);
        self.set_local_depth(index, depth - 1);
    }

    pub fn local_depth_mask(&self, index: usize) -> u32 {
        (1 << self.local_depth(index)) - 1
    }

    /// The slot differing from `index` in exactly the highest local bit:
    /// the bucket this one split from, or would merge back into.
    pub fn split_image_index(&self, index: usize) -> usize {
        let depth = self.local_depth(index);
        assert!(depth > 0);
        index ^ (1 << (depth - 1))
    }

    /// The directory may halve only while no live bucket uses every
    /// global bit.
    pub fn can_shrink(&self) -> bool {
        self.data().global_depth > 0
            && (0..self.size()).all(|i| self.local_depth(i) < self.global_depth())
    }

    /// Diagnostic check of the directory invariants; panics on violation.
    pub fn verify_integrity(&self) {
        let mut reference_counts: HashMap<PageId, u32> = HashMap::new();
        let mut depths: HashMap<PageId, u32> = HashMap::new();

        for i in 0..self.size() {
            let page_id = self.bucket_page_id(i);
            let local_depth = self.local_depth(i);

            assert!(
                local_depth <= self.global_depth(),
                "slot {i}: local depth {local_depth} exceeds global depth {}",
                self.global_depth()
            );

            *reference_counts.entry(page_id).or_default() += 1;
            match depths.get(&page_id) {
                Some(&depth) => assert_eq!(
                    depth, local_depth,
                    "slots sharing bucket page {page_id} disagree on local depth"
                ),
                None => {
                    depths.insert(page_id, local_depth);
                }
            }
        }

        for (page_id, count) in reference_counts {
            let expected = 1 << (self.global_depth() - depths[&page_id]);
            assert_eq!(
                count, expected,
                "bucket page {page_id} referenced {count} times, expected {expected}"
            );
        }
    }
}
