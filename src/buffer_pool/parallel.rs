use super::{ArcBufferPool, BufferPoolManager};
use crate::pages::PageId;
use anyhow::{anyhow, Result};
use parking_lot::FairMutex;
use std::sync::Arc;

/// Stripes pages across independent [`BufferPoolManager`] instances to cut
/// latch contention: instance `i` owns every page id congruent to `i`
/// modulo the instance count, so routing needs no shared state.
pub struct ParallelBufferPoolManager {
    instances: Vec<ArcBufferPool>,
    pool_size: usize,
    next_instance: usize,
}

impl ParallelBufferPoolManager {
    /// All instances page against one shared storage directory; the
    /// striped id allocation keeps their page files disjoint.
    pub fn new(num_instances: usize, pool_size: usize, path: &str) -> Self {
        let instances = (0..num_instances)
            .map(|i| {
                Arc::new(FairMutex::new(BufferPoolManager::with_instance(
                    pool_size,
                    num_instances as u32,
                    i as u32,
                    path,
                )))
            })
            .collect();

        Self {
            instances,
            pool_size,
            next_instance: 0,
        }
    }

    /// Total frames across all instances.
    pub fn pool_size(&self) -> usize {
        self.pool_size * self.instances.len()
    }

    /// The instance responsible for a page id. Callers pin pages through
    /// the returned handle; frames never cross instances.
    pub fn instance(&self, page_id: PageId) -> ArcBufferPool {
        self.instances[page_id as usize % self.instances.len()].clone()
    }

    /// Creates a page on the first instance with a frame to spare, probing
    /// round-robin from a rotating start so allocation load spreads.
    pub fn new_page(&mut self) -> Result<PageId> {
        let start = self.next_instance;
        self.next_instance += 1;

        for offset in 0..self.instances.len() {
            let idx = (start + offset) % self.instances.len();
            let page_id = {
                let mut bpm = self.instances[idx].lock();
                bpm.new_page().map(|frame| frame.reader().get_page_id())
            };
            if let Ok(page_id) = page_id {
                return Ok(page_id);
            }
        }

        Err(anyhow!("every buffer pool instance is full"))
    }

    pub fn unpin(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance(page_id).lock().unpin(&page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        self.instance(page_id).lock().flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        self.instance(page_id).lock().delete_page(page_id)
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        for instance in &self.instances {
            instance.lock().flush_all_pages()?;
        }
        Ok(())
    }
}
