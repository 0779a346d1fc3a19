//! Status message
//!
//! Workers publish Status messages to the results topic; every subscriber
//! (the coordinator's reaper, monitoring tools) sees each one.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::JobState;

/// Distinguishes job lifecycle reports from VM lifecycle reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Job,
    Vm,
    /// Any type this build does not know about
    #[default]
    #[serde(other)]
    Other,
}

/// Progress report correlating a VM and a job
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<Uuid>,
    pub state: JobState,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl Status {
    /// Creates a job-typed status report
    pub fn job(vm_uuid: Uuid, job_uuid: Uuid, state: JobState, message: impl Into<String>) -> Self {
        Self {
            vm_uuid: Some(vm_uuid),
            job_uuid: Some(job_uuid),
            state,
            message_type: MessageType::Job,
            message: message.into(),
            stdout: None,
            stderr: None,
        }
    }

    /// Attaches captured runner output
    pub fn with_output(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn is_job(&self) -> bool {
        self.message_type == MessageType::Job
    }
}
