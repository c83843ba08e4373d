use crate::address::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    AutoVoteCast,
    AutoVoteFailed,
    HighRiskFlagged,
    DelegationGranted,
    DelegationRevoked,
    ProposalDetected,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AutoVoteCast => "AUTO_VOTE_CAST",
            Self::AutoVoteFailed => "AUTO_VOTE_FAILED",
            Self::HighRiskFlagged => "HIGH_RISK_FLAGGED",
            Self::DelegationGranted => "DELEGATION_GRANTED",
            Self::DelegationRevoked => "DELEGATION_REVOKED",
            Self::ProposalDetected => "PROPOSAL_DETECTED",
        })
    }
}

impl FromStr for AuditAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "AUTO_VOTE_CAST" => Self::AutoVoteCast,
            "AUTO_VOTE_FAILED" => Self::AutoVoteFailed,
            "HIGH_RISK_FLAGGED" => Self::HighRiskFlagged,
            "DELEGATION_GRANTED" => Self::DelegationGranted,
            "DELEGATION_REVOKED" => Self::DelegationRevoked,
            "PROPOSAL_DETECTED" => Self::ProposalDetected,
            other => return Err(format!("unknown audit action '{other}'")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteDirection {
    Against,
    For,
    Abstain,
}

impl VoteDirection {
    /// §6: "0 = AGAINST, 1 = FOR, 2 = ABSTAIN"
    pub fn as_contract_u8(self) -> u8 {
        match self {
            Self::Against => 0,
            Self::For => 1,
            Self::Abstain => 2,
        }
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Against => "AGAINST",
            Self::For => "FOR",
            Self::Abstain => "ABSTAIN",
        })
    }
}

impl FromStr for VoteDirection {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "AGAINST" => Self::Against,
            "FOR" => Self::For,
            "ABSTAIN" => Self::Abstain,
            other => return Err(format!("unknown vote direction '{other}'")),
        })
    }
}

/// §4.5: the fixed error-code set for on-chain vote call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteErrorCode {
    AlreadyVoted,
    NotDelegated,
    InsufficientPower,
    ProposalNotActive,
    RiskExceedsThreshold,
    NonceError,
    GasError,
    UnknownError,
}

impl VoteErrorCode {
    /// §4.5: "Error classification is by substring match against the revert
    /// reason; UNKNOWN_ERROR is the catch-all".
    pub fn classify(revert_reason: &str) -> Self {
        let lower = revert_reason.to_ascii_lowercase();
        if lower.contains("already voted") || lower.contains("alreadyvoted") {
            Self::AlreadyVoted
        } else if lower.contains("not delegated") || lower.contains("notdelegated") {
            Self::NotDelegated
        } else if lower.contains("insufficient") && lower.contains("power") {
            Self::InsufficientPower
        } else if lower.contains("not active") || lower.contains("proposalnotactive") {
            Self::ProposalNotActive
        } else if lower.contains("risk") && lower.contains("threshold") {
            Self::RiskExceedsThreshold
        } else if lower.contains("nonce") {
            Self::NonceError
        } else if lower.contains("gas") {
            Self::GasError
        } else {
            Self::UnknownError
        }
    }

    /// §4.5: "ALREADY_VOTED is not retried."
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::AlreadyVoted)
    }
}

impl fmt::Display for VoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlreadyVoted => "ALREADY_VOTED",
            Self::NotDelegated => "NOT_DELEGATED",
            Self::InsufficientPower => "INSUFFICIENT_POWER",
            Self::ProposalNotActive => "PROPOSAL_NOT_ACTIVE",
            Self::RiskExceedsThreshold => "RISK_EXCEEDS_THRESHOLD",
            Self::NonceError => "NONCE_ERROR",
            Self::GasError => "GAS_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        })
    }
}

/// §3: append-only; nothing is ever updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub proposal_id: Option<i64>,
    pub dao_governor: Address,
    pub delegator_address: Option<Address>,
    pub vote_direction: Option<VoteDirection>,
    pub risk_score_at_decision: Option<i32>,
    pub tx_hash: Option<String>,
    pub was_auto_vote: bool,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_already_voted() {
        assert_eq!(
            VoteErrorCode::classify("execution reverted: Already Voted"),
            VoteErrorCode::AlreadyVoted
        );
        assert!(!VoteErrorCode::AlreadyVoted.is_retryable());
    }

    #[test]
    fn classifies_nonce_and_gas() {
        assert_eq!(
            VoteErrorCode::classify("nonce too low"),
            VoteErrorCode::NonceError
        );
        assert_eq!(
            VoteErrorCode::classify("out of gas"),
            VoteErrorCode::GasError
        );
        assert!(VoteErrorCode::NonceError.is_retryable());
    }

    #[test]
    fn unknown_error_is_the_catch_all() {
        assert_eq!(
            VoteErrorCode::classify("some unrelated revert string"),
            VoteErrorCode::UnknownError
        );
    }

    #[test]
    fn vote_direction_contract_mapping() {
        assert_eq!(VoteDirection::Against.as_contract_u8(), 0);
        assert_eq!(VoteDirection::For.as_contract_u8(), 1);
        assert_eq!(VoteDirection::Abstain.as_contract_u8(), 2);
    }
}
