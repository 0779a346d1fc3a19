//! Job domain types
//!
//! A Job is one unit of executable workflow work. Its UUID is the correlation
//! key across every queue and the store and is never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CodecError;

/// Job record
///
/// Structure shared between coordinator (persists), worker (executes) and
/// producers (submit inside an Order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    /// Server-assigned numeric id, absent until the job is stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    pub job_uuid: Uuid,
    pub state: JobState,
    pub workflow_name: String,
    pub workflow_version: String,
    pub workflow_path: String,
    /// Content hash over workflow identity and arguments, used for dedup
    pub job_hash: String,
    pub arguments: BTreeMap<String, String>,
    pub extra_files: BTreeMap<String, String>,
    /// VM currently (or last) running this job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_ts: Option<DateTime<Utc>>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            job_id: None,
            job_uuid: Uuid::new_v4(),
            state: JobState::Start,
            workflow_name: String::new(),
            workflow_version: String::new(),
            workflow_path: String::new(),
            job_hash: String::new(),
            arguments: BTreeMap::new(),
            extra_files: BTreeMap::new(),
            vm_uuid: None,
            stdout: None,
            stderr: None,
            end_user: None,
            flavour: None,
            create_ts: None,
            update_ts: None,
        }
    }
}

impl Job {
    /// Creates a new job in the START state with a fresh UUID and computed hash
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        workflow_path: impl Into<String>,
        arguments: BTreeMap<String, String>,
    ) -> Self {
        let mut job = Self {
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            workflow_path: workflow_path.into(),
            arguments,
            ..Self::default()
        };
        job.job_hash = job.compute_hash();
        job
    }

    /// Hashes workflow identity plus arguments
    ///
    /// Arguments are visited in key order so the hash is independent of
    /// insertion order.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.workflow_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.workflow_version.as_bytes());
        hasher.update(b"\n");
        for (key, value) in &self.arguments {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Fills in the job hash when the producer left it blank
    pub fn ensure_hash(&mut self) {
        if self.job_hash.is_empty() {
            self.job_hash = self.compute_hash();
        }
    }

    /// Renders the arguments as the `key=value` parameter file the runner reads
    ///
    /// Line breaks and backslashes are escaped, as is `=` in keys, so every
    /// argument stays on a single line.
    pub fn parameter_file_contents(&self) -> String {
        self.arguments
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}\n",
                    escape_parameter(key, true),
                    escape_parameter(value, false)
                )
            })
            .collect()
    }

    /// Timestamp of the last observed change, falling back to creation time
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.update_ts.or(self.create_ts)
    }
}

fn escape_parameter(raw: &str, is_key: bool) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '=' if is_key => escaped.push_str("\\="),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Job lifecycle state
///
/// START is the value before admission, PENDING marks admission, RUNNING a
/// worker picked the job up. SUCCESS, FAILED and LOST are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Start,
    Pending,
    Running,
    Success,
    Failed,
    Lost,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Start,
        JobState::Pending,
        JobState::Running,
        JobState::Success,
        JobState::Failed,
        JobState::Lost,
    ];

    fn rank(self) -> u8 {
        match self {
            JobState::Start => 0,
            JobState::Pending => 1,
            JobState::Running => 2,
            JobState::Success | JobState::Failed | JobState::Lost => 3,
        }
    }

    /// True for SUCCESS, FAILED and LOST
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether a job in `self` may be moved to `next`
    ///
    /// Terminal states never change. Otherwise state may only move forward or
    /// stay put; staying in RUNNING is how heartbeats refresh a job.
    pub fn can_transition_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    /// Every state from which `self` is reachable in one step
    pub fn predecessors(self) -> Vec<JobState> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Start => "START",
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failed => "FAILED",
            JobState::Lost => "LOST",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CodecError::UnknownState {
                kind: "job",
                value: s.to_string(),
            })
    }
}
