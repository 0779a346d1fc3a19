//! Provision domain types
//!
//! A Provision tracks one VM's provisioning lifecycle. Rows are never
//! deleted; for a given IP address the row with the highest id is current.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CodecError;

/// Provision record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Provision {
    /// Server-assigned numeric id, absent until stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provision_id: Option<i64>,
    pub provision_uuid: Uuid,
    pub state: ProvisionState,
    pub cores: i32,
    pub mem_gb: i32,
    pub storage_gb: i32,
    /// Job this VM was requested for or is running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_ts: Option<DateTime<Utc>>,
}

impl Default for Provision {
    fn default() -> Self {
        Self {
            provision_id: None,
            provision_uuid: Uuid::new_v4(),
            state: ProvisionState::Start,
            cores: 0,
            mem_gb: 0,
            storage_gb: 0,
            job_uuid: None,
            ip_address: None,
            create_ts: None,
            update_ts: None,
        }
    }
}

impl Provision {
    /// Creates a provision request for the given resources
    pub fn new(cores: i32, mem_gb: i32, storage_gb: i32) -> Self {
        Self {
            cores,
            mem_gb,
            storage_gb,
            ..Self::default()
        }
    }
}

/// Provision lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionState {
    #[default]
    Start,
    Pending,
    Running,
    Success,
    Failed,
}

impl ProvisionState {
    pub const ALL: [ProvisionState; 5] = [
        ProvisionState::Start,
        ProvisionState::Pending,
        ProvisionState::Running,
        ProvisionState::Success,
        ProvisionState::Failed,
    ];

    fn rank(self) -> u8 {
        match self {
            ProvisionState::Start => 0,
            ProvisionState::Pending => 1,
            ProvisionState::Running => 2,
            ProvisionState::Success | ProvisionState::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Same forward-only rule as jobs: terminal states are final
    pub fn can_transition_to(self, next: ProvisionState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn predecessors(self) -> Vec<ProvisionState> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionState::Start => "START",
            ProvisionState::Pending => "PENDING",
            ProvisionState::Running => "RUNNING",
            ProvisionState::Success => "SUCCESS",
            ProvisionState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionState {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CodecError::UnknownState {
                kind: "provision",
                value: s.to_string(),
            })
    }
}
