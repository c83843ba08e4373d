//! §4.5's per-result pipeline: resolve, decide, filter eligible
//! delegations, batch-vote with individual fallback, and transition the
//! proposal to its terminal status.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use aegis_store::db::Repository;
use aegis_types::analysis::{synthesize_report_hash, Analysis};
use aegis_types::audit::{AuditAction, AuditEntry, VoteDirection, VoteErrorCode};
use aegis_types::decision::{
    decide_status_after_voting, decide_status_without_eligible_delegations, decide_vote_direction, scale_score_to_basis_points,
};
use aegis_types::delegation::Delegation;
use aegis_types::error::ExecutorError;
use aegis_types::proposal::{Proposal, ProposalStatus};

use crate::backend::{VoteBackend, SIGNING_DISABLED_REASON};

const NON_TERMINAL_STATUSES: &[ProposalStatus] = &[
    ProposalStatus::PendingAnalysis,
    ProposalStatus::Analyzing,
    ProposalStatus::NeedsReview,
];

pub struct VoteExecutor {
    repo: Arc<dyn Repository>,
    backend: Arc<dyn VoteBackend>,
}

impl VoteExecutor {
    pub fn new(repo: Arc<dyn Repository>, backend: Arc<dyn VoteBackend>) -> Self {
        Self { repo, backend }
    }

    pub async fn process(&self, analysis: Analysis) -> Result<(), ExecutorError> {
        let _timer = aegis_telemetry::time::PipelineTimer::start();

        let Some(proposal) = self.repo.find_proposal_by_id(analysis.proposal_id).await? else {
            tracing::warn!(proposal_id = analysis.proposal_id, "stale complete event for unknown proposal, dropping");
            return Ok(());
        };

        let direction = decide_vote_direction(analysis.recommendation, analysis.composite_risk_score);

        let active = self
            .repo
            .list_active_delegations(&proposal.dao_governor_address, proposal.chain_id)
            .await?;

        let mut eligible = Vec::new();
        for delegation in active {
            if delegation.is_high_risk_for(analysis.composite_risk_score) {
                self.repo
                    .append_audit(&high_risk_flagged_entry(&proposal, &delegation, &analysis))
                    .await?;
                continue;
            }
            if delegation.is_eligible_for(analysis.composite_risk_score) {
                eligible.push(delegation);
            }
            // requires_approval == true with a safe score: excluded silently (§4.5).
        }

        if eligible.is_empty() {
            let status = decide_status_without_eligible_delegations(analysis.composite_risk_score);
            self.repo
                .transition_proposal_status(proposal.id, NON_TERMINAL_STATUSES, status)
                .await?;
            self.repo
                .append_audit(&no_eligible_delegations_entry(&proposal, &analysis, status))
                .await?;
            return Ok(());
        }

        let created_at_unix_ms = Utc::now().timestamp_millis();
        let report_hash = if analysis.report_hash == [0u8; 32] {
            synthesize_report_hash(&analysis.analysis_id, created_at_unix_ms)
        } else {
            analysis.report_hash
        };
        let score_bps = scale_score_to_basis_points(analysis.composite_risk_score);

        let mut to_vote = Vec::new();
        for delegation in eligible {
            let already_cast = self
                .repo
                .has_successful_vote_cast(proposal.id, &delegation.delegator_address)
                .await?;
            if already_cast {
                continue;
            }
            to_vote.push(delegation);
        }

        if !to_vote.is_empty() {
            self.cast_votes(&proposal, &to_vote, direction, score_bps, report_hash).await?;
        }

        let final_status = decide_status_after_voting(analysis.recommendation);
        self.repo
            .transition_proposal_status(proposal.id, NON_TERMINAL_STATUSES, final_status)
            .await?;

        Ok(())
    }

    /// Attempts the batch call first; on revert or transport failure,
    /// falls back to one `cast_vote_with_risk` per delegator (§4.5).
    async fn cast_votes(
        &self,
        proposal: &Proposal,
        delegations: &[Delegation],
        direction: VoteDirection,
        score_bps: u64,
        report_hash: [u8; 32],
    ) -> Result<(), ExecutorError> {
        let proposal_ids: Vec<String> = delegations.iter().map(|_| proposal.onchain_proposal_id.clone()).collect();
        let delegators: Vec<_> = delegations.iter().map(|d| d.delegator_address.clone()).collect();
        let directions = vec![direction; delegations.len()];
        let scores = vec![score_bps; delegations.len()];
        let hashes = vec![report_hash; delegations.len()];

        let batch_result = self
            .backend
            .cast_multiple_votes(&proposal.dao_governor_address, &proposal_ids, &delegators, &directions, &scores, &hashes)
            .await;

        match batch_result {
            Ok(tx_hash) => {
                let entries: Vec<AuditEntry> = delegations
                    .iter()
                    .map(|d| vote_cast_entry(proposal, d, direction, Some(tx_hash.clone())))
                    .collect();
                self.repo.bulk_append_audit(&entries).await?;
                for _ in delegations {
                    aegis_telemetry::executor_metrics().inc_votes_cast(direction_label(direction));
                }
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(proposal_id = proposal.id, reason = %reason, "batch vote failed, falling back to individual casts");
                aegis_telemetry::executor_metrics().inc_batch_reverts();
                self.cast_votes_individually(proposal, delegations, direction, score_bps, report_hash).await
            }
        }
    }

    async fn cast_votes_individually(
        &self,
        proposal: &Proposal,
        delegations: &[Delegation],
        direction: VoteDirection,
        score_bps: u64,
        report_hash: [u8; 32],
    ) -> Result<(), ExecutorError> {
        for delegation in delegations {
            let mut result = self
                .backend
                .cast_vote_with_risk(&proposal.onchain_proposal_id, &delegation.delegator_address, direction, score_bps, report_hash)
                .await;

            // §7: "NONCE_ERROR and GAS_ERROR are retried once with
            // refreshed signer state before surfacing."
            if let Err(reason) = &result {
                let code = VoteErrorCode::classify(reason);
                if matches!(code, VoteErrorCode::NonceError | VoteErrorCode::GasError) {
                    tracing::info!(delegator = %delegation.delegator_address, code = %code, "retrying vote once after transient signer error");
                    result = self
                        .backend
                        .cast_vote_with_risk(&proposal.onchain_proposal_id, &delegation.delegator_address, direction, score_bps, report_hash)
                        .await;
                }
            }

            match result {
                Ok(tx_hash) => {
                    self.repo
                        .append_audit(&vote_cast_entry(proposal, delegation, direction, Some(tx_hash)))
                        .await?;
                    aegis_telemetry::executor_metrics().inc_votes_cast(direction_label(direction));
                }
                Err(reason) if reason == SIGNING_DISABLED_REASON => {
                    self.repo
                        .append_audit(&signing_disabled_entry(proposal, delegation, direction))
                        .await?;
                }
                Err(reason) => {
                    let code = VoteErrorCode::classify(&reason);
                    self.repo
                        .append_audit(&vote_failed_entry(proposal, delegation, direction, code, &reason))
                        .await?;
                    aegis_telemetry::executor_metrics().inc_votes_failed(code_label(code));
                    if !code.is_retryable() {
                        tracing::info!(delegator = %delegation.delegator_address, code = %code, "vote not retryable, leaving as failed");
                    }
                }
            }
        }
        Ok(())
    }
}

fn truncate_reason(reason: &str) -> String {
    reason.chars().take(200).collect()
}

fn direction_label(direction: VoteDirection) -> &'static str {
    match direction {
        VoteDirection::For => "for",
        VoteDirection::Against => "against",
        VoteDirection::Abstain => "abstain",
    }
}

fn code_label(code: VoteErrorCode) -> &'static str {
    match code {
        VoteErrorCode::AlreadyVoted => "already_voted",
        VoteErrorCode::NotDelegated => "not_delegated",
        VoteErrorCode::InsufficientPower => "insufficient_power",
        VoteErrorCode::ProposalNotActive => "proposal_not_active",
        VoteErrorCode::RiskExceedsThreshold => "risk_exceeds_threshold",
        VoteErrorCode::NonceError => "nonce_error",
        VoteErrorCode::GasError => "gas_error",
        VoteErrorCode::UnknownError => "unknown_error",
    }
}

fn high_risk_flagged_entry(proposal: &Proposal, delegation: &Delegation, analysis: &Analysis) -> AuditEntry {
    AuditEntry {
        action: AuditAction::HighRiskFlagged,
        proposal_id: Some(proposal.id),
        dao_governor: proposal.dao_governor_address.clone(),
        delegator_address: Some(delegation.delegator_address.clone()),
        vote_direction: None,
        risk_score_at_decision: Some(analysis.composite_risk_score),
        tx_hash: None,
        was_auto_vote: false,
        metadata: json!({ "risk_threshold": delegation.risk_threshold }),
        created_at: Utc::now(),
    }
}

fn no_eligible_delegations_entry(proposal: &Proposal, analysis: &Analysis, status: ProposalStatus) -> AuditEntry {
    AuditEntry {
        action: AuditAction::AutoVoteFailed,
        proposal_id: Some(proposal.id),
        dao_governor: proposal.dao_governor_address.clone(),
        delegator_address: None,
        vote_direction: None,
        risk_score_at_decision: Some(analysis.composite_risk_score),
        tx_hash: None,
        was_auto_vote: false,
        metadata: json!({ "reason": "no eligible delegations", "resulting_status": status.to_string() }),
        created_at: Utc::now(),
    }
}

fn vote_cast_entry(proposal: &Proposal, delegation: &Delegation, direction: VoteDirection, tx_hash: Option<String>) -> AuditEntry {
    AuditEntry {
        action: AuditAction::AutoVoteCast,
        proposal_id: Some(proposal.id),
        dao_governor: proposal.dao_governor_address.clone(),
        delegator_address: Some(delegation.delegator_address.clone()),
        vote_direction: Some(direction),
        risk_score_at_decision: proposal.composite_risk_score,
        tx_hash,
        was_auto_vote: true,
        metadata: json!({}),
        created_at: Utc::now(),
    }
}

fn vote_failed_entry(
    proposal: &Proposal,
    delegation: &Delegation,
    direction: VoteDirection,
    code: VoteErrorCode,
    reason: &str,
) -> AuditEntry {
    AuditEntry {
        action: AuditAction::AutoVoteFailed,
        proposal_id: Some(proposal.id),
        dao_governor: proposal.dao_governor_address.clone(),
        delegator_address: Some(delegation.delegator_address.clone()),
        vote_direction: Some(direction),
        risk_score_at_decision: proposal.composite_risk_score,
        tx_hash: None,
        was_auto_vote: true,
        metadata: json!({ "error_code": code.to_string(), "reason": truncate_reason(reason) }),
        created_at: Utc::now(),
    }
}

fn signing_disabled_entry(proposal: &Proposal, delegation: &Delegation, direction: VoteDirection) -> AuditEntry {
    AuditEntry {
        action: AuditAction::AutoVoteFailed,
        proposal_id: Some(proposal.id),
        dao_governor: proposal.dao_governor_address.clone(),
        delegator_address: Some(delegation.delegator_address.clone()),
        vote_direction: Some(direction),
        risk_score_at_decision: proposal.composite_risk_score,
        tx_hash: None,
        was_auto_vote: true,
        metadata: json!({ "reason": "signing disabled" }),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aegis_types::address::Address;
    use aegis_types::analysis::{Recommendation, RiskLevel};
    use aegis_types::delegation::DelegationStatus;
    use aegis_types::error::StoreError;
    use aegis_types::proposal::ProposalKey;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRepo {
        proposals: Mutex<Vec<Proposal>>,
        delegations: Mutex<Vec<Delegation>>,
        audit: Mutex<Vec<AuditEntry>>,
        statuses: Mutex<Vec<(i64, ProposalStatus)>>,
        successful_votes: Mutex<Vec<(i64, Address)>>,
    }

    #[async_trait]
    impl Repository for FakeRepo {
        async fn upsert_proposal(&self, proposal: &Proposal) -> Result<(Proposal, bool), StoreError> {
            self.proposals.lock().unwrap().push(proposal.clone());
            Ok((proposal.clone(), true))
        }
        async fn find_proposal_by_onchain_key(&self, key: &ProposalKey) -> Result<Option<Proposal>, StoreError> {
            Ok(self.proposals.lock().unwrap().iter().find(|p| &p.key() == key).cloned())
        }
        async fn find_proposal_by_id(&self, id: i64) -> Result<Option<Proposal>, StoreError> {
            Ok(self.proposals.lock().unwrap().iter().find(|p| p.id == id).cloned())
        }
        async fn transition_proposal_status(
            &self,
            proposal_id: i64,
            _from_set: &[ProposalStatus],
            to: ProposalStatus,
        ) -> Result<(), StoreError> {
            self.statuses.lock().unwrap().push((proposal_id, to));
            Ok(())
        }
        async fn upsert_delegation(&self, delegation: &Delegation) -> Result<bool, StoreError> {
            self.delegations.lock().unwrap().push(delegation.clone());
            Ok(true)
        }
        async fn mark_delegation_revoked(
            &self,
            _key: &aegis_types::delegation::DelegationKey,
            _revoke_tx_hash: &str,
            _block: u64,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn list_active_delegations(&self, _dao: &Address, _chain_id: u64) -> Result<Vec<Delegation>, StoreError> {
            Ok(self.delegations.lock().unwrap().clone())
        }
        async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
            self.audit.lock().unwrap().push(entry.clone());
            Ok(())
        }
        async fn bulk_append_audit(&self, entries: &[AuditEntry]) -> Result<(), StoreError> {
            self.audit.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }
        async fn upsert_analysis(&self, _analysis: &Analysis) -> Result<(), StoreError> {
            Ok(())
        }
        async fn has_successful_vote_cast(&self, proposal_id: i64, delegator: &Address) -> Result<bool, StoreError> {
            Ok(self
                .successful_votes
                .lock()
                .unwrap()
                .iter()
                .any(|(id, d)| *id == proposal_id && d == delegator))
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        batch_should_fail: bool,
        individual_should_fail_for: Vec<Address>,
        nonce_fails_remaining: Mutex<u32>,
    }

    #[async_trait]
    impl VoteBackend for FakeBackend {
        async fn cast_multiple_votes(
            &self,
            _dao_governor: &Address,
            _proposal_ids: &[String],
            _delegators: &[Address],
            _directions: &[VoteDirection],
            _scores_bps: &[u64],
            _report_hashes: &[[u8; 32]],
        ) -> Result<String, String> {
            if self.batch_should_fail {
                Err("execution reverted: unknown".to_string())
            } else {
                Ok("0xbatch".to_string())
            }
        }

        async fn cast_vote_with_risk(
            &self,
            _proposal_id: &str,
            delegator: &Address,
            _direction: VoteDirection,
            _score_bps: u64,
            _report_hash: [u8; 32],
        ) -> Result<String, String> {
            let mut nonce_fails = self.nonce_fails_remaining.lock().unwrap();
            if *nonce_fails > 0 {
                *nonce_fails -= 1;
                return Err("nonce too low".to_string());
            }
            drop(nonce_fails);

            if self.individual_should_fail_for.contains(delegator) {
                Err("execution reverted: Already Voted".to_string())
            } else {
                Ok(format!("0xtx-{}", delegator.as_str()))
            }
        }
    }

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn sample_proposal() -> Proposal {
        Proposal {
            id: 1,
            onchain_proposal_id: "9".to_string(),
            dao_governor_address: addr(1),
            chain_id: 1,
            title: "Title".to_string(),
            description: "Desc".to_string(),
            proposer_address: addr(2),
            voting_start_block: 1,
            voting_end_block: 2,
            targets: vec![],
            values: vec![],
            calldatas: vec![],
            detected_at_block: 1,
            creation_tx_hash: "0x1".to_string(),
            status: ProposalStatus::Analyzing,
            composite_risk_score: None,
        }
    }

    fn sample_delegation(delegator: u8, threshold: i32, requires_approval: bool) -> Delegation {
        Delegation {
            delegator_address: addr(delegator),
            dao_governor: addr(1),
            chain_id: 1,
            risk_threshold: threshold,
            requires_approval,
            status: DelegationStatus::Active,
            last_event_block: 1,
            last_event_tx_hash: "0x1".to_string(),
            revoke_tx_hash: None,
        }
    }

    fn sample_analysis(score: i32, recommendation: Recommendation) -> Analysis {
        Analysis {
            proposal_id: 1,
            analysis_id: "a1".to_string(),
            composite_risk_score: score,
            risk_level: RiskLevel::Low,
            recommendation,
            report_hash: [0u8; 32],
            processing_time_ms: 10,
            model_version: "v1".to_string(),
        }
    }

    #[tokio::test]
    async fn zero_eligible_delegations_short_circuits_to_auto_approved() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(10, Recommendation::Approve)).await.unwrap();

        let statuses = repo.statuses.lock().unwrap();
        assert_eq!(statuses[0], (1, ProposalStatus::AutoApproved));
    }

    #[tokio::test]
    async fn zero_eligible_delegations_high_score_goes_to_needs_review() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(80, Recommendation::Review)).await.unwrap();

        let statuses = repo.statuses.lock().unwrap();
        assert_eq!(statuses[0], (1, ProposalStatus::NeedsReview));
    }

    #[tokio::test]
    async fn high_risk_delegation_is_flagged_and_excluded() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 10, false));
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(50, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::HighRiskFlagged));
    }

    #[tokio::test]
    async fn batch_success_casts_for_all_eligible() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 100, false));
        repo.delegations.lock().unwrap().push(sample_delegation(4, 100, false));
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        assert_eq!(audit.iter().filter(|e| e.action == AuditAction::AutoVoteCast).count(), 2);
        let statuses = repo.statuses.lock().unwrap();
        assert_eq!(statuses[0], (1, ProposalStatus::AutoApproved));
    }

    #[tokio::test]
    async fn batch_failure_falls_back_to_individual_casts() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 100, false));
        let backend = Arc::new(FakeBackend {
            batch_should_fail: true,
            individual_should_fail_for: vec![],
            ..Default::default()
        });
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        assert!(audit.iter().any(|e| e.action == AuditAction::AutoVoteCast));
    }

    #[tokio::test]
    async fn already_voted_is_recorded_but_not_retried() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 100, false));
        let backend = Arc::new(FakeBackend {
            batch_should_fail: true,
            individual_should_fail_for: vec![addr(3)],
            ..Default::default()
        });
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        let failed = audit.iter().find(|e| e.action == AuditAction::AutoVoteFailed).unwrap();
        assert_eq!(failed.metadata["error_code"], "ALREADY_VOTED");
    }

    #[tokio::test]
    async fn nonce_error_is_retried_once_and_then_succeeds() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 100, false));
        let backend = Arc::new(FakeBackend {
            batch_should_fail: true,
            nonce_fails_remaining: Mutex::new(1),
            ..Default::default()
        });
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        assert_eq!(audit.iter().filter(|e| e.action == AuditAction::AutoVoteCast).count(), 1);
        assert!(!audit.iter().any(|e| e.action == AuditAction::AutoVoteFailed));
    }

    #[tokio::test]
    async fn already_cast_delegations_are_skipped() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 100, false));
        repo.successful_votes.lock().unwrap().push((1, addr(3)));
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        assert!(!audit.iter().any(|e| e.action == AuditAction::AutoVoteCast));
    }

    #[tokio::test]
    async fn requires_approval_is_excluded_silently() {
        let repo = Arc::new(FakeRepo::default());
        repo.proposals.lock().unwrap().push(sample_proposal());
        repo.delegations.lock().unwrap().push(sample_delegation(3, 100, true));
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();

        let audit = repo.audit.lock().unwrap();
        assert!(audit.iter().all(|e| e.action != AuditAction::HighRiskFlagged && e.action != AuditAction::AutoVoteCast));
    }

    #[tokio::test]
    async fn unknown_proposal_is_dropped_without_error() {
        let repo = Arc::new(FakeRepo::default());
        let backend = Arc::new(FakeBackend::default());
        let executor = VoteExecutor::new(repo.clone(), backend);

        executor.process(sample_analysis(20, Recommendation::Approve)).await.unwrap();
        assert!(repo.statuses.lock().unwrap().is_empty());
    }
}
