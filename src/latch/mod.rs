use parking_lot::lock_api::RawRwLock;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader-writer latch over the raw `parking_lot` lock.
///
/// The raw API lets a latch be acquired and released across separate
/// function calls, which scoped guards cannot express. Used both as the
/// table-level latch of an index and as the per-page latch on [`crate::pages::Page`].
#[derive(Debug, Default)]
pub struct Latch {
    lock: RwLock<()>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    pub fn rlock(&self) {
        unsafe { self.lock.raw() }.lock_shared();
    }

    pub fn runlock(&self) {
        unsafe { self.lock.raw().unlock_shared() };
    }

    pub fn wlock(&self) {
        unsafe { self.lock.raw() }.lock_exclusive();
    }

    pub fn wunlock(&self) {
        unsafe { self.lock.raw().unlock_exclusive() };
    }

    #[allow(unused)]
    pub fn rguard(&self) -> RwLockReadGuard<()> {
        self.lock.read()
    }

    #[allow(unused)]
    pub fn wguard(&self) -> RwLockWriteGuard<()> {
        self.lock.write()
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}
