//! `POST /jobs/rename`: run one bulk rename against the local store.

use crate::{
    errors::AppError,
    state::{AppState, JobSettings},
};
use axum::{Json, extract::State};
use cos_rename::{
    models::rename::{Credentials, RunConfig, RunStatusReport, RunSummary, TaskResult},
    services::rename_engine::RenameEngine,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SUMMARY_NAME: &str = "cos-rename";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameJobRequest {
    #[serde(flatten)]
    pub config: RunConfig,
    /// Receives a copy of the response once the run finishes.
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RenameJobResponse {
    pub status: RunStatusReport,
    pub messages: Vec<String>,
    pub results: Vec<TaskResult>,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub async fn run_rename_job(
    State(state): State<AppState>,
    Json(request): Json<RenameJobRequest>,
) -> Result<Json<RenameJobResponse>, AppError> {
    authorize(&state.settings, &request.config.credentials)?;
    let RenameJobRequest {
        config,
        callback_url,
    } = request;

    let engine = Arc::new(RenameEngine::new(
        Arc::new(state.storage.clone()),
        config,
        state.settings.engine,
    ));
    let watcher = AbortOnDrop(spawn_timeout_watcher(engine.clone(), state.settings.timeout));
    let results = engine.run().await;
    drop(watcher);

    let summary = RunSummary::from_results(SUMMARY_NAME, &results);
    info!("{}", summary.messages.join("\n"));
    let response = RenameJobResponse {
        status: summary.status,
        messages: summary.messages,
        results,
    };

    if let Some(url) = callback_url.as_deref() {
        send_callback(url, &response).await;
    }
    Ok(Json(response))
}

/// Only the configured credential pair may start a job.
fn authorize(settings: &JobSettings, credentials: &Credentials) -> Result<(), AppError> {
    if credentials.secret_id == settings.secret_id && credentials.secret_key == settings.secret_key
    {
        Ok(())
    } else {
        Err(AppError::unauthorized("credentials do not match this deployment"))
    }
}

/// Cancel `engine` once `timeout` has elapsed.
fn spawn_timeout_watcher(engine: Arc<RenameEngine>, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        engine.cancel(format!(
            "rename job timed out after {}s",
            timeout.as_secs()
        ));
    })
}

/// Failures are logged and otherwise ignored.
async fn send_callback(url: &str, response: &RenameJobResponse) {
    let sent = reqwest::Client::new()
        .post(url)
        .timeout(CALLBACK_TIMEOUT)
        .json(response)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status);
    match sent {
        Ok(resp) => info!("callback to {} answered {}", url, resp.status()),
        Err(err) => warn!("callback to {} failed: {}", url, err),
    }
}
