use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::pages::PageId;

/// Fixed-size binary codec for index keys and values.
///
/// Entries are stored inline in bucket pages, so every implementor encodes
/// to exactly [`Storable::SIZE`] bytes in native byte order.
pub trait Storable: Clone {
    const SIZE: usize;

    fn write_to(&self, dst: &mut [u8]);
    fn read_from(src: &[u8]) -> Self;
}

macro_rules! storable_int {
    ($($t:ty),*) => {
        $(
            impl Storable for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn write_to(&self, dst: &mut [u8]) {
                    dst[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                fn read_from(src: &[u8]) -> Self {
                    <$t>::from_ne_bytes(src[..Self::SIZE].try_into().unwrap())
                }
            }
        )*
    };
}

storable_int!(u16, u32, u64, i16, i32, i64);

/// Record identifier: the page holding a tuple and its slot within the page.
/// The usual value type of an index over a heap table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl Storable for Rid {
    const SIZE: usize = 8;

    fn write_to(&self, dst: &mut [u8]) {
        dst[..4].copy_from_slice(&self.page_id.to_ne_bytes());
        dst[4..8].copy_from_slice(&self.slot.to_ne_bytes());
    }

    fn read_from(src: &[u8]) -> Self {
        Self {
            page_id: PageId::from_ne_bytes(src[..4].try_into().unwrap()),
            slot: u32::from_ne_bytes(src[4..8].try_into().unwrap()),
        }
    }
}

/// Total order over index keys.
pub trait Comparator<K>: Send + Sync {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering;
}

/// Comparator delegating to the key's [`Ord`].
pub struct OrdComparator<K>(PhantomData<fn(K)>);

impl<K> OrdComparator<K> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K> Default for OrdComparator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord> Comparator<K> for OrdComparator<K> {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// 64-bit hash over index keys. The hash index downcasts the result to
/// 32 bits before masking with the directory depth.
pub trait KeyHash<K>: Send + Sync {
    fn hash_key(&self, key: &K) -> u64;
}

/// Hashes through the standard library's [`DefaultHasher`].
#[derive(Default)]
pub struct DefaultKeyHash;

impl<K: Hash> KeyHash<K> for DefaultKeyHash {
    fn hash_key(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }
}
