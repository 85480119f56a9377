//! Shared state handed to every handler.

use cos_rename::services::{rename_engine::EngineOptions, storage_service::StorageService};
use std::{sync::Arc, time::Duration};

/// Settings a rename job runs with.
#[derive(Clone)]
pub struct JobSettings {
    /// The credential pair a job request must present.
    pub secret_id: String,
    pub secret_key: String,
    pub engine: EngineOptions,
    /// A job still running after this long is canceled.
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub settings: Arc<JobSettings>,
}
