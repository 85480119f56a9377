//! Bulk server-side rename of COS objects.
//!
//! `services::rename_engine::RenameEngine` copies each object of a run to a
//! key built from a template, then optionally deletes the source. The object
//! store is reached through `services::store::ObjectStore`;
//! `services::storage_service::StorageService` implements it locally on
//! SQLite and disk.

pub mod models;
pub mod services;
