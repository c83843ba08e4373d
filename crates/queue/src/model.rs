//! The job and payload shapes carried across the three priority lanes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    Normal,
    Low,
}

impl JobPriority {
    pub fn lane_name(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Lanes drained highest priority first.
    pub const ALL_IN_ORDER: [JobPriority; 3] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];
}

/// §4.4: "the payload carries the on-chain proposal id, DAO governor,
/// chain id, proposer, title, description, and a metadata map with the
/// raw event fields."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub onchain_proposal_id: String,
    pub dao_governor: String,
    pub chain_id: u64,
    pub proposer: String,
    pub title: String,
    pub description: String,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The proposal's internal identifier; doubles as the job identifier
    /// so repeated enqueue attempts are naturally idempotent.
    pub id: i64,
    pub priority: JobPriority,
    pub payload: JobPayload,
    pub attempt: u32,
}
