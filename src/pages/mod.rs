pub mod indexes;
pub(crate) mod traits;

use crate::latch::Latch;
use std::sync::Arc;
use traits::Serialize;

pub const PAGE_SIZE: usize = 4096; // 4 KBs

pub type PageId = i32;
pub const INVALID_PAGE: PageId = -1;

/// A generic page: [`PAGE_SIZE`] bytes of content plus the frame-resident
/// metadata the buffer pool tracks for it. Typed views (directory, bucket)
/// reinterpret the byte buffer while the page stays pinned; the buffer
/// leads the struct at a fixed alignment so overlaid records line up.
#[repr(C, align(4))]
pub struct Page {
    data: [u8; PAGE_SIZE],
    page_id: PageId,
    is_dirty: bool,
    latch: Arc<Latch>,
}

impl Page {
    pub fn new() -> Self {
        Page {
            data: [0u8; PAGE_SIZE],
            page_id: INVALID_PAGE,
            is_dirty: false,
            latch: Arc::new(Latch::new()),
        }
    }

    pub fn get_page_id(&self) -> PageId {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Latch protecting the page content. Shared with typed views so a
    /// holder can keep latching after the `&mut Page` borrow ends.
    pub fn get_latch(&self) -> &Arc<Latch> {
        &self.latch
    }

    pub fn read_bytes(&self, start: usize, end: usize) -> &[u8] {
        &self.data[start..end]
    }

    pub fn write_bytes(&mut self, start: usize, end: usize, bytes: &[u8]) {
        self.data[start..end].copy_from_slice(bytes);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for Page {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), PAGE_SIZE);
        let mut page = Page::new();
        page.data.copy_from_slice(bytes);
        page
    }
}
