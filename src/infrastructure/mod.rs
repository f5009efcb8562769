//! Storage adapters implementing the [`TokenStore`](crate::domain::ports::TokenStore) port.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
