//! Order message
//!
//! An Order pairs the Job a producer wants run with the Provision it needs.
//! Producers publish Orders to the orders queue; the coordinator fans them out.

use serde::{Deserialize, Serialize};

use crate::domain::job::Job;
use crate::domain::provision::Provision;

/// Request for one job on one VM
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    pub job: Job,
    pub provision: Provision,
}

impl Order {
    pub fn new(job: Job, provision: Provision) -> Self {
        Self { job, provision }
    }
}
