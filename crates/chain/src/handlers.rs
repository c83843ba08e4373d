//! Per-event handlers (§4.3). Each handler is idempotent: replaying the
//! same event after a crash must not duplicate a proposal, delegation,
//! or audit entry.

use chrono::Utc;
use serde_json::json;

use aegis_queue::{AnalysisQueue, JobPayload, JobPriority};
use aegis_store::db::Repository;
use aegis_store::kv::{keys, KvBackend};
use aegis_types::address::Address;
use aegis_types::audit::{AuditAction, AuditEntry};
use aegis_types::delegation::{Delegation, DelegationKey, DelegationStatus};
use aegis_types::error::ChainError;
use aegis_types::proposal::{extract_title, Proposal, ProposalStatus};

use crate::events::{DelegationGrantedEvent, DelegationRevokedEvent, ProposalCreatedEvent};

const LOCK_TTL_SECS: u64 = 30;

/// §4.3 *ProposalCreated*: lock, upsert, audit, enqueue, advance cursor,
/// unlock. Skips entirely (not an error) if the lock is already held --
/// another worker is handling the same proposal.
pub async fn handle_proposal_created(
    repo: &dyn Repository,
    kv: &dyn KvBackend,
    queue: &AnalysisQueue,
    dao_governor: &Address,
    chain_id: u64,
    event: ProposalCreatedEvent,
) -> Result<(), ChainError> {
    let lock_key = keys::scanner_lock(&event.onchain_proposal_id);
    let acquired = kv.set_nx_ex(&lock_key, "1", LOCK_TTL_SECS).await?;
    if !acquired {
        tracing::debug!(proposal_id = %event.onchain_proposal_id, "lock held, skipping duplicate detection");
        return Ok(());
    }

    let result = handle_proposal_created_locked(repo, queue, dao_governor, chain_id, event).await;

    if let Err(e) = kv.del(&lock_key).await {
        tracing::warn!(error = %e, "failed to release scanner lock");
    }
    result
}

async fn handle_proposal_created_locked(
    repo: &dyn Repository,
    queue: &AnalysisQueue,
    dao_governor: &Address,
    chain_id: u64,
    event: ProposalCreatedEvent,
) -> Result<(), ChainError> {
    let title = extract_title(&event.description);

    let proposal = Proposal {
        id: 0, // assigned by the store on insert; ignored on update
        onchain_proposal_id: event.onchain_proposal_id.clone(),
        dao_governor_address: dao_governor.clone(),
        chain_id,
        title,
        description: event.description,
        proposer_address: event.proposer,
        voting_start_block: event.start_block,
        voting_end_block: event.end_block,
        targets: event.targets,
        values: event.values,
        calldatas: event.calldatas,
        detected_at_block: event.block_number,
        creation_tx_hash: event.tx_hash.clone(),
        status: ProposalStatus::PendingAnalysis,
        composite_risk_score: None,
    };

    let (stored, inserted) = repo.upsert_proposal(&proposal).await?;

    if inserted {
        repo.append_audit(&AuditEntry {
            action: AuditAction::ProposalDetected,
            proposal_id: Some(stored.id),
            dao_governor: dao_governor.clone(),
            delegator_address: None,
            vote_direction: None,
            risk_score_at_decision: None,
            tx_hash: Some(event.tx_hash),
            was_auto_vote: false,
            metadata: json!({ "onchain_proposal_id": stored.onchain_proposal_id }),
            created_at: Utc::now(),
        })
        .await?;
    } else {
        tracing::debug!(proposal_id = stored.id, "replayed proposal creation, skipping duplicate audit entry");
    }

    queue
        .add_job(
            stored.id,
            JobPayload {
                onchain_proposal_id: stored.onchain_proposal_id.clone(),
                dao_governor: dao_governor.to_string(),
                chain_id,
                proposer: stored.proposer_address.to_string(),
                title: stored.title.clone(),
                description: stored.description.clone(),
                metadata: json!({
                    "targets": stored.targets.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                    "values": stored.values,
                    "calldatas": stored.calldatas,
                }),
            },
            JobPriority::Normal,
        )
        .await
        .map_err(|e| ChainError::MalformedEvent(e.to_string()))?;

    Ok(())
}

/// §4.3 *VotingPowerDelegated*: upsert ACTIVE, clearing any prior revoke hash.
pub async fn handle_delegation_granted(
    repo: &dyn Repository,
    chain_id: u64,
    event: DelegationGrantedEvent,
) -> Result<(), ChainError> {
    let inserted = repo
        .upsert_delegation(&Delegation {
            delegator_address: event.user.clone(),
            dao_governor: event.dao_governor.clone(),
            chain_id,
            risk_threshold: event.risk_threshold,
            requires_approval: false,
            status: DelegationStatus::Active,
            last_event_block: event.block_number,
            last_event_tx_hash: event.tx_hash.clone(),
            revoke_tx_hash: None,
        })
        .await?;

    if inserted {
        repo.append_audit(&AuditEntry {
            action: AuditAction::DelegationGranted,
            proposal_id: None,
            dao_governor: event.dao_governor,
            delegator_address: Some(event.user),
            vote_direction: None,
            risk_score_at_decision: None,
            tx_hash: Some(event.tx_hash),
            was_auto_vote: false,
            metadata: json!({ "risk_threshold": event.risk_threshold }),
            created_at: Utc::now(),
        })
        .await?;
    } else {
        tracing::debug!(delegator = %event.user, "replayed delegation grant, skipping duplicate audit entry");
    }

    Ok(())
}

/// §4.3 *DelegationRevoked*: transition to REVOKED. An unknown triple is
/// logged and ignored by the store layer, not surfaced as an error here.
pub async fn handle_delegation_revoked(
    repo: &dyn Repository,
    chain_id: u64,
    event: DelegationRevokedEvent,
) -> Result<(), ChainError> {
    let key = DelegationKey {
        delegator_address: event.user.clone(),
        dao_governor: event.dao_governor.clone(),
        chain_id,
    };
    let revoked = repo.mark_delegation_revoked(&key, &event.tx_hash, event.block_number).await?;

    if revoked {
        repo.append_audit(&AuditEntry {
            action: AuditAction::DelegationRevoked,
            proposal_id: None,
            dao_governor: event.dao_governor,
            delegator_address: Some(event.user),
            vote_direction: None,
            risk_score_at_decision: None,
            tx_hash: Some(event.tx_hash),
            was_auto_vote: false,
            metadata: json!({}),
            created_at: Utc::now(),
        })
        .await?;
    } else {
        tracing::debug!(delegator = %event.user, "replayed or unknown delegation revoke, skipping duplicate audit entry");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_queue::QueueBackend;
    use aegis_store::db::Repository;
    use aegis_types::error::{KvError, StoreError};
    use aegis_types::proposal::ProposalKey;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeRepo {
        proposals: Mutex<Vec<Proposal>>,
        delegations: Mutex<HashMap<(String, String, u64), Delegation>>,
        audit: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl Repository for FakeRepo {
        async fn upsert_proposal(&self, proposal: &Proposal) -> Result<(Proposal, bool), StoreError> {
            let mut proposals = self.proposals.lock().unwrap();
            if let Some(existing) = proposals.iter_mut().find(|p| p.key() == proposal.key()) {
                existing.description = proposal.description.clone();
                return Ok((existing.clone(), false));
            }
            let mut stored = proposal.clone();
            stored.id = proposals.len() as i64 + 1;
            proposals.push(stored.clone());
            Ok((stored, true))
        }
        async fn find_proposal_by_onchain_key(&self, key: &ProposalKey) -> Result<Option<Proposal>, StoreError> {
            Ok(self.proposals.lock().unwrap().iter().find(|p| &p.key() == key).cloned())
        }
        async fn find_proposal_by_id(&self, id: i64) -> Result<Option<Proposal>, StoreError> {
            Ok(self.proposals.lock().unwrap().iter().find(|p| p.id == id).cloned())
        }
        async fn transition_proposal_status(
            &self,
            _proposal_id: i64,
            _from_set: &[ProposalStatus],
            _to: ProposalStatus,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn upsert_delegation(&self, delegation: &Delegation) -> Result<bool, StoreError> {
            let mut delegations = self.delegations.lock().unwrap();
            let key = (
                delegation.delegator_address.to_string(),
                delegation.dao_governor.to_string(),
                delegation.chain_id,
            );
            let inserted = !delegations.contains_key(&key);
            delegations.insert(key, delegation.clone());
            Ok(inserted)
        }
        async fn mark_delegation_revoked(
            &self,
            key: &DelegationKey,
            revoke_tx_hash: &str,
            block: u64,
        ) -> Result<bool, StoreError> {
            let mut delegations = self.delegations.lock().unwrap();
            if let Some(d) = delegations.get_mut(&(
                key.delegator_address.to_string(),
                key.dao_governor.to_string(),
                key.chain_id,
            )) {
                if d.status == DelegationStatus::Revoked {
                    return Ok(false);
                }
                d.status = DelegationStatus::Revoked;
                d.revoke_tx_hash = Some(revoke_tx_hash.to_string());
                d.last_event_block = block;
                return Ok(true);
            }
            Ok(false)
        }
        async fn list_active_delegations(&self, _dao: &Address, _chain_id: u64) -> Result<Vec<Delegation>, StoreError> {
            Ok(self
                .delegations
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.status == DelegationStatus::Active)
                .cloned()
                .collect())
        }
        async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
            self.audit.lock().unwrap().push(entry.clone());
            Ok(())
        }
        async fn bulk_append_audit(&self, entries: &[AuditEntry]) -> Result<(), StoreError> {
            self.audit.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }
        async fn upsert_analysis(&self, _analysis: &aegis_types::analysis::Analysis) -> Result<(), StoreError> {
            Ok(())
        }
        async fn has_successful_vote_cast(&self, _proposal_id: i64, _delegator: &Address) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct FakeKv {
        locks: Mutex<HashMap<String, ()>>,
    }

    #[async_trait]
    impl KvBackend for FakeKv {
        async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), KvError> {
            Ok(())
        }
        async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), KvError> {
            Ok(())
        }
        async fn del(&self, key: &str) -> Result<(), KvError> {
            self.locks.lock().unwrap().remove(key);
            Ok(())
        }
        async fn set_nx_ex(&self, key: &str, _value: &str, _ttl_secs: u64) -> Result<bool, KvError> {
            let mut locks = self.locks.lock().unwrap();
            if locks.contains_key(key) {
                Ok(false)
            } else {
                locks.insert(key.to_string(), ());
                Ok(true)
            }
        }
        async fn get_del(&self, _key: &str) -> Result<Option<String>, KvError> {
            Ok(None)
        }
        async fn zadd_window(&self, _key: &str, _member: &str, _score: f64) -> Result<(), KvError> {
            Ok(())
        }
        async fn zcount_window(&self, _key: &str, _min: f64, _max: f64) -> Result<u64, KvError> {
            Ok(0)
        }
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), KvError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeQueueBackend {
        jobs: Mutex<HashMap<i64, String>>,
        lanes: Mutex<HashMap<String, Vec<i64>>>,
    }

    #[async_trait]
    impl QueueBackend for FakeQueueBackend {
        async fn store_job_if_absent(&self, id: i64, json: &str) -> Result<bool, KvError> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&id) {
                Ok(false)
            } else {
                jobs.insert(id, json.to_string());
                Ok(true)
            }
        }
        async fn load_job(&self, id: i64) -> Result<Option<String>, KvError> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
        async fn delete_job(&self, id: i64) -> Result<(), KvError> {
            self.jobs.lock().unwrap().remove(&id);
            Ok(())
        }
        async fn push_lane(&self, lane: &str, id: i64) -> Result<(), KvError> {
            self.lanes.lock().unwrap().entry(lane.to_string()).or_default().push(id);
            Ok(())
        }
        async fn pop_lane(&self, _lane: &str) -> Result<Option<i64>, KvError> {
            Ok(None)
        }
        async fn remove_from_lane(&self, _lane: &str, _id: i64) -> Result<(), KvError> {
            Ok(())
        }
        async fn lane_depth(&self, lane: &str) -> Result<u64, KvError> {
            Ok(self.lanes.lock().unwrap().get(lane).map(|v| v.len()).unwrap_or(0) as u64)
        }
        async fn set_lease(&self, _id: i64, _json: &str, _ttl_secs: u64) -> Result<(), KvError> {
            Ok(())
        }
        async fn get_lease(&self, _id: i64) -> Result<Option<String>, KvError> {
            Ok(None)
        }
        async fn clear_lease(&self, _id: i64) -> Result<(), KvError> {
            Ok(())
        }
        async fn all_lease_ids(&self) -> Result<Vec<i64>, KvError> {
            Ok(vec![])
        }
    }

    fn addr(n: u8) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    fn sample_event() -> ProposalCreatedEvent {
        ProposalCreatedEvent {
            onchain_proposal_id: "7".to_string(),
            proposer: addr(1),
            targets: vec![addr(2)],
            values: vec!["0".to_string()],
            calldatas: vec!["0x".to_string()],
            start_block: 100,
            end_block: 200,
            description: "# My Proposal\nDo the thing".to_string(),
            block_number: 50,
            tx_hash: "0xabc".to_string(),
        }
    }

    #[tokio::test]
    async fn proposal_created_is_idempotent_under_replay() {
        let repo = FakeRepo::default();
        let kv = FakeKv::default();
        let queue = AnalysisQueue::new(Arc::new(FakeQueueBackend::default()), 3, 30_000);
        let dao = addr(9);

        handle_proposal_created(&repo, &kv, &queue, &dao, 1, sample_event()).await.unwrap();
        handle_proposal_created(&repo, &kv, &queue, &dao, 1, sample_event()).await.unwrap();

        assert_eq!(repo.proposals.lock().unwrap().len(), 1);
        assert_eq!(
            repo.audit
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.action == AuditAction::ProposalDetected)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn proposal_created_extracts_title_from_description() {
        let repo = FakeRepo::default();
        let kv = FakeKv::default();
        let queue = AnalysisQueue::new(Arc::new(FakeQueueBackend::default()), 3, 30_000);
        let dao = addr(9);

        handle_proposal_created(&repo, &kv, &queue, &dao, 1, sample_event()).await.unwrap();
        let stored = repo.proposals.lock().unwrap()[0].clone();
        assert_eq!(stored.title, "My Proposal");
    }

    #[tokio::test]
    async fn delegation_revoked_for_unknown_triple_does_not_error() {
        let repo = FakeRepo::default();
        let event = DelegationRevokedEvent {
            user: addr(1),
            dao_governor: addr(2),
            block_number: 1,
            tx_hash: "0xdead".to_string(),
        };
        handle_delegation_revoked(&repo, 1, event).await.unwrap();
    }

    #[tokio::test]
    async fn delegation_granted_then_revoked_round_trip() {
        let repo = FakeRepo::default();
        let user = addr(1);
        let dao = addr(2);

        handle_delegation_granted(
            &repo,
            1,
            DelegationGrantedEvent {
                user: user.clone(),
                dao_governor: dao.clone(),
                risk_threshold: 40,
                block_number: 10,
                tx_hash: "0x1".to_string(),
            },
        )
        .await
        .unwrap();

        handle_delegation_revoked(
            &repo,
            1,
            DelegationRevokedEvent {
                user: user.clone(),
                dao_governor: dao.clone(),
                block_number: 11,
                tx_hash: "0x2".to_string(),
            },
        )
        .await
        .unwrap();

        let active = repo.list_active_delegations(&dao, 1).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn delegation_granted_is_idempotent_under_replay() {
        let repo = FakeRepo::default();
        let user = addr(1);
        let dao = addr(2);
        let event = || DelegationGrantedEvent {
            user: user.clone(),
            dao_governor: dao.clone(),
            risk_threshold: 40,
            block_number: 10,
            tx_hash: "0x1".to_string(),
        };

        handle_delegation_granted(&repo, 1, event()).await.unwrap();
        handle_delegation_granted(&repo, 1, event()).await.unwrap();

        assert_eq!(
            repo.audit
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.action == AuditAction::DelegationGranted)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn delegation_revoked_is_idempotent_under_replay() {
        let repo = FakeRepo::default();
        let user = addr(1);
        let dao = addr(2);

        handle_delegation_granted(
            &repo,
            1,
            DelegationGrantedEvent {
                user: user.clone(),
                dao_governor: dao.clone(),
                risk_threshold: 40,
                block_number: 10,
                tx_hash: "0x1".to_string(),
            },
        )
        .await
        .unwrap();

        let revoke_event = || DelegationRevokedEvent {
            user: user.clone(),
            dao_governor: dao.clone(),
            block_number: 11,
            tx_hash: "0x2".to_string(),
        };
        handle_delegation_revoked(&repo, 1, revoke_event()).await.unwrap();
        handle_delegation_revoked(&repo, 1, revoke_event()).await.unwrap();

        assert_eq!(
            repo.audit
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.action == AuditAction::DelegationRevoked)
                .count(),
            1
        );
    }
}
