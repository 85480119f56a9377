//! Inputs and outputs of one rename run.

use crate::services::error::RenameError;
use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};
use std::fmt;

/// Identifies a source object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub region: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            key: key.into(),
        }
    }

    /// Directory placeholders (`foo/`) are never renamed.
    pub fn is_directory(&self) -> bool {
        self.key.ends_with('/')
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.bucket, self.key)
    }
}

/// The object created by a successful copy.
pub type CopyOutcome = ObjectRef;

/// Credentials the store client signs with.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// What started the invocation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TriggerType {
    CosTrigger,
    CosWorkflow,
    Timer,
    Apigateway,
    #[default]
    Invoke,
}

impl TriggerType {
    /// Workflow-triggered copies carry an extra provenance header.
    pub fn is_workflow(self) -> bool {
        matches!(self, TriggerType::CosWorkflow)
    }
}

fn default_true() -> bool {
    true
}

/// Immutable configuration for one run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default)]
    pub objects: Vec<ObjectRef>,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub target_key_template: String,
    /// Used only when `target_key_template` is empty.
    #[serde(default)]
    pub target_prefix: String,
    #[serde(default)]
    pub delete_source_key: bool,
    #[serde(default)]
    pub default_timezone: Option<String>,
    /// When false, objects carrying the loop-prevention marker are processed anyway.
    #[serde(default = "default_true")]
    pub avoid_loop_risk: bool,
}

impl RunConfig {
    pub fn new(credentials: Credentials, objects: Vec<ObjectRef>, template: &str) -> Self {
        Self {
            credentials,
            objects,
            trigger_type: TriggerType::default(),
            target_key_template: template.to_string(),
            target_prefix: String::new(),
            delete_source_key: false,
            default_timezone: None,
            avoid_loop_risk: true,
        }
    }

    /// The effective destination-key template.
    pub fn key_template(&self) -> String {
        if self.target_key_template.is_empty() {
            format!("{}${{Key}}", self.target_prefix)
        } else {
            self.target_key_template.clone()
        }
    }
}

/// Successful outcome of one object task.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum TaskOutput {
    /// The object was deliberately left alone; carries the reason.
    Skipped(String),
    /// The object was copied to a new key.
    Copied(CopyOutcome),
}

/// Exactly one per input object, in input order.
#[derive(Debug)]
pub struct TaskResult {
    pub params: ObjectRef,
    pub outcome: Result<TaskOutput, RenameError>,
}

impl TaskResult {
    pub fn result(&self) -> Option<&TaskOutput> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RenameError> {
        self.outcome.as_ref().err()
    }
}

impl Serialize for TaskResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskResult", 3)?;
        state.serialize_field("params", &self.params)?;
        state.serialize_field("result", &self.result())?;
        state.serialize_field("error", &self.error().map(ToString::to_string))?;
        state.end()
    }
}

/// Overall status of a finished run.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatusReport {
    Success,
    Fail,
}

/// Human-readable digest of a run, as logged and returned by the harness.
#[derive(Serialize, Clone, Debug)]
pub struct RunSummary {
    pub status: RunStatusReport,
    pub success: usize,
    pub total: usize,
    pub messages: Vec<String>,
}

const SUMMARY_DETAIL_LIMIT: usize = 20;

impl RunSummary {
    /// Build a summary. When the detail list would be truncated and any task
    /// failed, only failures are detailed.
    pub fn from_results(name: &str, results: &[TaskResult]) -> Self {
        let truncated = results.len() > SUMMARY_DETAIL_LIMIT;
        let has_error = results.iter().any(|r| r.error().is_some());
        let mut details = Vec::new();
        let mut success = 0;

        for task in results {
            let params = serde_json::to_string(&task.params).unwrap_or_default();
            match &task.outcome {
                Err(err) => {
                    if details.len() < SUMMARY_DETAIL_LIMIT {
                        details.push(format!(
                            "TaskStatus: fail\nParams: {}\nError: {}",
                            params, err
                        ));
                    }
                }
                Ok(output) => {
                    if details.len() < SUMMARY_DETAIL_LIMIT && !(truncated && has_error) {
                        details.push(format!(
                            "TaskStatus: success\nParams: {}\nResult: {}",
                            params,
                            serde_json::to_string(output).unwrap_or_default()
                        ));
                    }
                    success += 1;
                }
            }
        }

        let total = results.len();
        let status = if success == total {
            RunStatusReport::Success
        } else {
            RunStatusReport::Fail
        };
        let mut messages = vec![format!(
            "Result: {} {}\nsuccess: {}\ntotal: {}",
            name,
            if success == total { "success" } else { "fail" },
            success,
            total
        )];
        messages.extend(details);

        Self {
            status,
            success,
            total,
            messages,
        }
    }
}
