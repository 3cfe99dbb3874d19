pub mod buffer_pool;
pub mod disk_manager;
pub mod indexes;
pub mod latch;
pub mod pages;
pub mod types;

/// Opaque handle of an externally managed transaction. Index operations
/// accept it for interface compatibility; this layer never inspects it.
pub type TxnId = u64;
