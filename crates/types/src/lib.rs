//! Shared domain types, configuration, and error taxonomy for the AEGIS
//! auto-voting orchestrator.

pub mod address;
pub mod analysis;
pub mod audit;
pub mod config;
pub mod decision;
pub mod delegation;
pub mod error;
pub mod proposal;

pub use address::Address;
pub use analysis::{Analysis, Recommendation, RiskLevel};
pub use audit::{AuditAction, AuditEntry, VoteDirection, VoteErrorCode};
pub use config::OrchestratorConfig;
pub use delegation::{Delegation, DelegationKey, DelegationStatus};
pub use error::ErrorCode;
pub use proposal::{Proposal, ProposalKey, ProposalStatus};
