//! Types exchanged between the provisioner and its callers.

pub mod admin;
pub mod clouds;

use crate::options::SlaveOptions;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

/// A JSON response body that knows which HTTP status it should be sent with.
pub trait JsonProxiedStatus: Serialize + for<'de> Deserialize<'de> {
    fn status_code(&self) -> StatusCode;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormValidationKind {
    Ok,
    Warning,
    Error,
}

/// Outcome of validating user input, as presented by a configuration form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormValidation {
    pub kind: FormValidationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FormValidation {
    pub fn ok() -> Self {
        Self {
            kind: FormValidationKind::Ok,
            message: None,
        }
    }
    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            kind: FormValidationKind::Ok,
            message: Some(message.into()),
        }
    }
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: FormValidationKind::Warning,
            message: Some(message.into()),
        }
    }
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FormValidationKind::Error,
            message: Some(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// How the controller should start the worker process on a new server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerLauncher {
    /// Wait for the agent to call back.
    Jnlp,
    /// Connect to `host` over SSH as `username`, authenticating with the
    /// private key stored under `credentials_id`.
    Ssh {
        credentials_id: String,
        username: String,
        host: Option<String>,
    },
}

/// A freshly provisioned worker, ready to be registered with the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Server (and node) name.
    pub name: String,
    pub server_id: String,
    pub cloud: String,
    pub template: String,
    pub labels: String,
    pub num_executors: NonZeroU32,
    pub fs_root: String,
    pub jvm_options: Option<String>,
    pub launcher: WorkerLauncher,
    /// Minutes a worker may stay idle before being retired.
    pub retention_time: u32,
    /// Address the controller should use to reach the worker.
    pub address: Option<String>,
    pub provisioned_at: DateTime<Utc>,
}

/// A cloud as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSummary {
    pub name: String,
    pub endpoint_url: String,
    pub region: Option<String>,
    pub effective_options: SlaveOptions,
    pub templates: Vec<TemplateSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSummary {
    pub name: String,
    pub labels: String,
    pub effective_options: SlaveOptions,
}

/// A server belonging to a cloud, as reported by the worker listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerServer {
    pub server_id: String,
    pub name: String,
    pub status: String,
    pub template: Option<String>,
    pub addresses: Vec<String>,
}
