//! Routes of the rename service.
//!
//! - `GET  /healthz`, `GET /readyz`: probes
//! - `PUT  /{bucket}`: create a bucket in the local store
//! - `PUT  /{bucket}/{*key}`: upload an object
//! - `HEAD /{bucket}/{*key}`: object headers
//! - `POST /jobs/rename`: run a bulk rename
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{create_bucket, head_object, upload_object},
        rename_handlers::run_rename_job,
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/jobs/rename", post(run_rename_job))
        .route("/{bucket}/{*key}", put(upload_object).head(head_object))
        .route("/{bucket}", put(create_bucket))
}
