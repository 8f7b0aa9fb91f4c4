//! Shared keyed store: trait plus Redis and in-process implementations.

pub mod memory;
pub mod redis_repo;
pub mod store;
#[cfg(test)]
pub mod testing;

pub use memory::MemoryStore;
pub use redis_repo::RedisStore;
pub use store::{CappedAdd, EphemeralStore, WindowState};
