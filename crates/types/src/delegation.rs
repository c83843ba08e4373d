use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationStatus {
    Active,
    Revoked,
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Revoked => "REVOKED",
        })
    }
}

impl FromStr for DelegationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ACTIVE" => Self::Active,
            "REVOKED" => Self::Revoked,
            other => return Err(format!("unknown delegation status '{other}'")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationKey {
    pub delegator_address: Address,
    pub dao_governor: Address,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub delegator_address: Address,
    pub dao_governor: Address,
    pub chain_id: u64,
    pub risk_threshold: i32,
    pub requires_approval: bool,
    pub status: DelegationStatus,
    pub last_event_block: u64,
    pub last_event_tx_hash: String,
    pub revoke_tx_hash: Option<String>,
}

impl Delegation {
    pub fn key(&self) -> DelegationKey {
        DelegationKey {
            delegator_address: self.delegator_address.clone(),
            dao_governor: self.dao_governor.clone(),
            chain_id: self.chain_id,
        }
    }

    /// §3: "A delegation with `composite_risk_score > threshold` is
    /// high-risk"; eligibility additionally requires `requires_approval ==
    /// false` and an ACTIVE status. `<=` is the inclusive boundary (§8).
    pub fn is_eligible_for(&self, composite_risk_score: i32) -> bool {
        self.status == DelegationStatus::Active
            && !self.requires_approval
            && composite_risk_score <= self.risk_threshold
    }

    pub fn is_high_risk_for(&self, composite_risk_score: i32) -> bool {
        self.status == DelegationStatus::Active
            && !self.requires_approval
            && composite_risk_score > self.risk_threshold
    }
}
