use crate::pages::traits::Serialize;
use crate::pages::{Page, PageId, INVALID_PAGE, PAGE_SIZE};
use anyhow::{anyhow, Result};
use std::fs::OpenOptions;
use std::io::prelude::*;
use std::path::PathBuf;

/// Page-granular storage over a backing directory, one file per page id.
#[derive(Debug)]
pub struct DiskManager {
    path: PathBuf,
}

impl DiskManager {
    pub fn new(path: &str) -> Self {
        std::fs::create_dir_all(path).expect("storage directory created");
        Self {
            path: PathBuf::from(path),
        }
    }

    fn page_path(&self, page_id: PageId) -> PathBuf {
        self.path.join(page_id.to_string())
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        if page.get_page_id() == INVALID_PAGE {
            return Err(anyhow!("asked to write a page with invalid id"));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.page_path(page.get_page_id()))?;

        file.write_all(page.as_bytes())?;
        Ok(())
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(self.page_path(page_id))?;

        let mut buffer = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buffer)?;

        let mut page = Page::from_bytes(&buffer);
        page.set_page_id(page_id);
        Ok(page)
    }

    /// Placeholder. The storage layer does not reclaim page files; deleted
    /// page ids are simply never handed out again.
    pub fn deallocate_page(&self, _page_id: PageId) {}
}

/// Fresh scratch directory under the system temp dir, unique per call.
#[cfg(test)]
pub(crate) fn test_path() -> String {
    std::env::temp_dir()
        .join(format!("minnow-test-{}-{:08x}", std::process::id(), rand::random::<u32>()))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleanup_disk(dm: DiskManager) -> Result<()> {
        Ok(std::fs::remove_dir_all(dm.path)?)
    }

    #[test]
    fn test_write_then_read() -> Result<()> {
        let disk = DiskManager::new(&test_path());
        let page_id = 9999;

        let mut page = Page::new();
        page.set_page_id(page_id);
        page.write_bytes(0, 4, &[1, 2, 3, 4]);

        disk.write_page(&page)?;
        let read_page = disk.read_page(page_id)?;

        assert_eq!(read_page.get_page_id(), page_id);
        assert_eq!(read_page.as_bytes(), page.as_bytes());

        cleanup_disk(disk)?;

        Ok(())
    }

    #[test]
    fn test_read_missing_page_fails() {
        let disk = DiskManager::new(&test_path());

        assert!(disk.read_page(1234).is_err());

        cleanup_disk(disk).unwrap();
    }

    #[test]
    fn test_write_invalid_page_fails() {
        let disk = DiskManager::new(&test_path());

        assert!(disk.write_page(&Page::new()).is_err());

        cleanup_disk(disk).unwrap();
    }
}
