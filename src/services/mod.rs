//! The rename engine and the object stores it runs against.

pub mod copy_executor;
pub mod error;
pub mod hashing;
pub mod metadata_cache;
pub mod rename_engine;
pub mod replacement;
pub mod retry;
pub mod storage_service;
pub mod store;
pub mod template;

#[cfg(test)]
pub(crate) mod test_support;
