//! Backing-store implementations for queue state

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::MemoryStorage;
pub use redis::RedisStorage;
pub use traits::Storage;
