use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// §3: status transitions only move forward through this list; skipping is
/// allowed, regressing is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    PendingAnalysis,
    Analyzing,
    NeedsReview,
    AutoApproved,
    AutoRejected,
    Executed,
    Failed,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PendingAnalysis => "PENDING_ANALYSIS",
            Self::Analyzing => "ANALYZING",
            Self::NeedsReview => "NEEDS_REVIEW",
            Self::AutoApproved => "AUTO_APPROVED",
            Self::AutoRejected => "AUTO_REJECTED",
            Self::Executed => "EXECUTED",
            Self::Failed => "FAILED",
        })
    }
}

impl FromStr for ProposalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING_ANALYSIS" => Self::PendingAnalysis,
            "ANALYZING" => Self::Analyzing,
            "NEEDS_REVIEW" => Self::NeedsReview,
            "AUTO_APPROVED" => Self::AutoApproved,
            "AUTO_REJECTED" => Self::AutoRejected,
            "EXECUTED" => Self::Executed,
            "FAILED" => Self::Failed,
            other => return Err(format!("unknown proposal status '{other}'")),
        })
    }
}

impl ProposalStatus {
    /// The declared ordering for §3's "status transitions only in the order
    /// listed" invariant. `Failed` is reachable from any non-terminal state
    /// (§4.4's retry-exhaustion path), so it is treated as always-forward.
    fn ordinal(self) -> u8 {
        match self {
            Self::PendingAnalysis => 0,
            Self::Analyzing => 1,
            Self::NeedsReview => 2,
            Self::AutoApproved => 3,
            Self::AutoRejected => 3,
            Self::Executed => 4,
            Self::Failed => 5,
        }
    }

    /// True if transitioning `self -> next` does not regress, per §3.
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == Self::Failed {
            return true;
        }
        next.ordinal() >= self.ordinal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalKey {
    pub onchain_proposal_id: String,
    pub dao_governor_address: Address,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: i64,
    pub onchain_proposal_id: String,
    pub dao_governor_address: Address,
    pub chain_id: u64,
    pub title: String,
    pub description: String,
    pub proposer_address: Address,
    pub voting_start_block: u64,
    pub voting_end_block: u64,
    pub targets: Vec<Address>,
    pub values: Vec<String>,
    pub calldatas: Vec<String>,
    pub detected_at_block: u64,
    pub creation_tx_hash: String,
    pub status: ProposalStatus,
    pub composite_risk_score: Option<i32>,
}

impl Proposal {
    pub fn key(&self) -> ProposalKey {
        ProposalKey {
            onchain_proposal_id: self.onchain_proposal_id.clone(),
            dao_governor_address: self.dao_governor_address.clone(),
            chain_id: self.chain_id,
        }
    }
}

/// §4.3 "Title extraction", required to be deterministic.
pub fn extract_title(description: &str) -> String {
    const MAX_LEN: usize = 500;
    let first_line = description.split('\n').next().unwrap_or("");
    let trimmed = first_line.trim_start();
    let without_heading = strip_markdown_heading(trimmed);
    let candidate = without_heading.trim();

    if candidate.is_empty() {
        return "Untitled Proposal".to_string();
    }

    if candidate.chars().count() > MAX_LEN {
        let truncated: String = candidate.chars().take(MAX_LEN).collect();
        format!("{}...", truncated)
    } else {
        candidate.to_string()
    }
}

fn strip_markdown_heading(line: &str) -> &str {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 {
        return line;
    }
    let rest = &line[hashes..];
    match rest.strip_prefix(|c: char| c.is_whitespace()) {
        Some(stripped) => stripped,
        None => line,
    }
}
