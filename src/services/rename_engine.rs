//! Runs one bulk rename over a list of objects.
//!
//! Each object is processed by an independent task:
//! cancellation gate → directory check → loop-risk check → replacement map
//! → server-side copy → optional source delete. Tasks run with bounded
//! concurrency and results come back in input order. A task failure is
//! recorded on its `TaskResult` and never affects sibling tasks.
//!
//! Run-wide state is limited to the status, the cancellation reason and the
//! registry of open hashing streams. Metadata caches and replacement maps are
//! created per task.

use crate::models::rename::{ObjectRef, RunConfig, TaskOutput, TaskResult};
use crate::services::{
    copy_executor::{copy_object, delete_object, is_loop_risk},
    error::{RenameError, RenameResult},
    metadata_cache::CachedStore,
    replacement::build_replacement_map,
    retry::{RetryPolicy, retry},
    store::ObjectStore,
};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a run. Transitions only move forward; `Canceled` is terminal.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Waiting,
    Running,
    Canceled,
}

struct RunStateInner {
    status: RunStatus,
    in_flight: HashMap<Uuid, CancellationToken>,
}

/// Mutable state shared by every task of one run.
pub struct RunState {
    inner: Mutex<RunStateInner>,
    cancel_reason: OnceLock<Arc<str>>,
    canceled: CancellationToken,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RunStateInner {
                status: RunStatus::Waiting,
                in_flight: HashMap::new(),
            }),
            cancel_reason: OnceLock::new(),
            canceled: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    /// `Waiting → Running`; any other status is left as is.
    fn start(&self) -> RunStatus {
        let mut inner = self.lock();
        if inner.status == RunStatus::Waiting {
            inner.status = RunStatus::Running;
        }
        inner.status
    }

    /// Mark the run canceled and abort every registered stream.
    ///
    /// Only the first reason is kept; returns whether this call supplied it.
    pub fn cancel(&self, reason: &str) -> bool {
        let first = self.cancel_reason.set(Arc::from(reason)).is_ok();
        let mut inner = self.lock();
        inner.status = RunStatus::Canceled;
        for token in inner.in_flight.values() {
            token.cancel();
        }
        self.canceled.cancel();
        first
    }

    /// Fail with the run's cancellation error once it has been canceled.
    pub fn check(&self) -> RenameResult<()> {
        match self.cancel_reason.get() {
            Some(reason) => Err(RenameError::Canceled(reason.clone())),
            None => Ok(()),
        }
    }

    /// Fires once the run is canceled.
    pub fn canceled(&self) -> &CancellationToken {
        &self.canceled
    }

    /// The cancellation error, for callers that observed an aborted stream.
    pub fn cancel_error(&self) -> RenameError {
        let reason = self
            .cancel_reason
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::from("canceled"));
        RenameError::Canceled(reason)
    }

    /// Register a cancel handle for `task_id`'s stream.
    ///
    /// Fails with the cancellation error if the run is already canceled, so
    /// no read is started after `cancel`.
    pub fn register_stream(&self, task_id: Uuid) -> RenameResult<CancellationToken> {
        let mut inner = self.lock();
        self.check()?;
        let token = CancellationToken::new();
        if let Some(previous) = inner.in_flight.insert(task_id, token.clone()) {
            previous.cancel();
        }
        Ok(token)
    }

    pub fn release_stream(&self, task_id: Uuid) {
        self.lock().in_flight.remove(&task_id);
    }

    pub fn in_flight_streams(&self) -> usize {
        self.lock().in_flight.len()
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a task's registry entry when the task ends, however it ends.
struct InFlightGuard<'a> {
    state: &'a RunState,
    task_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.release_stream(self.task_id);
    }
}

/// Everything one object's task threads through its steps.
pub struct TaskContext<'a> {
    pub store: &'a CachedStore<'a>,
    pub run: &'a RunState,
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Maximum number of objects processed at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct RenameEngine {
    store: Arc<dyn ObjectStore>,
    config: RunConfig,
    options: EngineOptions,
    state: RunState,
}

impl RenameEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: RunConfig, options: EngineOptions) -> Self {
        Self {
            store,
            config,
            options,
            state: RunState::new(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn in_flight_streams(&self) -> usize {
        self.state.in_flight_streams()
    }

    /// Cancel the run. Tasks not yet started fail immediately, open hashing
    /// streams are aborted, and completed copies are left in place.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state.cancel(&reason) {
            warn!("rename run canceled: {}", reason);
        } else {
            debug!("run already canceled, ignoring reason: {}", reason);
        }
    }

    /// Process every configured object. Never fails as a whole: each object
    /// yields exactly one `TaskResult`, in input order.
    pub async fn run(&self) -> Vec<TaskResult> {
        let status = self.state.start();
        let template = self.config.key_template();
        let concurrency = self.options.concurrency.max(1);
        info!(
            "renaming {} objects with template `{}` (status: {:?}, concurrency: {})",
            self.config.objects.len(),
            template,
            status,
            concurrency
        );

        let results: Vec<TaskResult> = stream::iter(self.config.objects.iter().cloned())
            .map(|object| self.run_task(object, &template))
            .buffered(concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.error().is_some()).count();
        info!(
            "rename run finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        results
    }

    async fn run_task(&self, object: ObjectRef, template: &str) -> TaskResult {
        let outcome = self.process(&object, template).await;
        match &outcome {
            Ok(TaskOutput::Skipped(reason)) => info!("{}: {}", object, reason),
            Ok(TaskOutput::Copied(destination)) => info!("{} renamed to {}", object, destination.key),
            Err(err) => error!("{} failed: {}", object, err),
        }
        TaskResult {
            params: object,
            outcome,
        }
    }

    async fn process(&self, object: &ObjectRef, template: &str) -> RenameResult<TaskOutput> {
        self.state.check()?;

        if object.is_directory() {
            return Ok(TaskOutput::Skipped(format!(
                "{} is a directory, skipped",
                object.key
            )));
        }

        let task_id = Uuid::new_v4();
        let _in_flight = InFlightGuard {
            state: &self.state,
            task_id,
        };
        let store = CachedStore::new(self.store.as_ref());
        let ctx = TaskContext {
            store: &store,
            run: &self.state,
            task_id,
        };
        let policy = &self.options.retry;
        let canceled = self.state.canceled();
        let check = || self.state.check();

        if self.config.avoid_loop_risk {
            let head = retry(policy, "head object", canceled, check, || async {
                store
                    .head_object(&object.bucket, &object.region, &object.key)
                    .await
                    .map_err(RenameError::from)
            })
            .await?;
            if is_loop_risk(&head) {
                return Ok(TaskOutput::Skipped(format!(
                    "{} was produced by a previous rename, skipped to avoid a copy loop",
                    object.key
                )));
            }
        }

        let timezone = self.config.default_timezone.as_deref();
        let replacements = retry(policy, "build replacement map", canceled, check, || {
            build_replacement_map(&ctx, object, template, timezone)
        })
        .await?;

        let destination = retry(policy, "copy object", canceled, check, || {
            copy_object(&ctx, object, &replacements, template, self.config.trigger_type)
        })
        .await?;

        if self.config.delete_source_key {
            if destination.bucket == object.bucket && destination.key == object.key {
                debug!("{} was copied onto itself, keeping it", object);
            } else {
                let deleted = retry(policy, "delete source", canceled, check, || delete_object(&ctx, object)).await?;
                debug!("deleted {}: {:?}", object, deleted);
            }
        }

        Ok(TaskOutput::Copied(destination))
    }
}
