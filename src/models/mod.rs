//! Core data models for the bulk rename pipeline.
//!
//! `bucket`, `object` and `metadata` are the rows of the local object store
//! and map onto database tables via `sqlx::FromRow`. `cos` holds the
//! request/response shapes every `ObjectStore` speaks, and `rename` the
//! per-run inputs and outputs of the rename engine.

pub mod bucket;
pub mod cos;
pub mod metadata;
pub mod object;
pub mod rename;
