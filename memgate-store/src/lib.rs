pub mod adapter;
pub mod memcached;
pub mod memory;
pub mod store;

pub use adapter::{CacheAdapter, MetadataEntry};
pub use memcached::MemcachedStore;
pub use memory::MemoryStore;
pub use store::{CasOutcome, CasToken, KvStore, RawEntry, Result, StoreError};
