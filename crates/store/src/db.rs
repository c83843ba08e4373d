//! The relational store (C2): typed Postgres operations over the four
//! tables owned by this crate. Built against `sqlx`'s runtime
//! `query`/`query_as` so the workspace compiles without a reachable
//! database, unlike the compile-time-checked `query!` macros.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use aegis_types::address::Address;
use aegis_types::analysis::Analysis;
use aegis_types::audit::AuditEntry;
use aegis_types::delegation::{Delegation, DelegationStatus};
use aegis_types::error::StoreError;
use aegis_types::proposal::{Proposal, ProposalKey, ProposalStatus};

fn parse_address(raw: &str) -> Result<Address, StoreError> {
    Address::parse(raw).map_err(|e| StoreError::Database(format!("stored address '{raw}' is invalid: {e}")))
}

fn parse_status(raw: &str) -> Result<ProposalStatus, StoreError> {
    raw.parse().map_err(StoreError::Database)
}

fn parse_delegation_status(raw: &str) -> Result<DelegationStatus, StoreError> {
    raw.parse().map_err(StoreError::Database)
}

fn json_string_array(raw: &JsonValue) -> Vec<String> {
    raw.as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn row_to_proposal(row: &sqlx::postgres::PgRow) -> Result<Proposal, StoreError> {
    let status_raw: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
    let targets_raw: JsonValue = row.try_get("targets").map_err(|e| StoreError::Database(e.to_string()))?;
    let values_raw: JsonValue = row.try_get("values_wei").map_err(|e| StoreError::Database(e.to_string()))?;
    let calldatas_raw: JsonValue = row.try_get("calldatas").map_err(|e| StoreError::Database(e.to_string()))?;
    let targets = json_string_array(&targets_raw)
        .into_iter()
        .map(|t| parse_address(&t))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Proposal {
        id: row.try_get("id").map_err(|e| StoreError::Database(e.to_string()))?,
        onchain_proposal_id: row
            .try_get("onchain_proposal_id")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        dao_governor_address: parse_address(
            &row.try_get::<String, _>("dao_governor_address")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        )?,
        chain_id: row
            .try_get::<i64, _>("chain_id")
            .map_err(|e| StoreError::Database(e.to_string()))? as u64,
        title: row.try_get("title").map_err(|e| StoreError::Database(e.to_string()))?,
        description: row
            .try_get("description")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        proposer_address: parse_address(
            &row.try_get::<String, _>("proposer_address")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        )?,
        voting_start_block: row
            .try_get::<i64, _>("voting_start_block")
            .map_err(|e| StoreError::Database(e.to_string()))? as u64,
        voting_end_block: row
            .try_get::<i64, _>("voting_end_block")
            .map_err(|e| StoreError::Database(e.to_string()))? as u64,
        targets,
        values: json_string_array(&values_raw),
        calldatas: json_string_array(&calldatas_raw),
        detected_at_block: row
            .try_get::<i64, _>("detected_at_block")
            .map_err(|e| StoreError::Database(e.to_string()))? as u64,
        creation_tx_hash: row
            .try_get("creation_tx_hash")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        status: parse_status(&status_raw)?,
        composite_risk_score: row
            .try_get("composite_risk_score")
            .map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn row_to_delegation(row: &sqlx::postgres::PgRow) -> Result<Delegation, StoreError> {
    let status_raw: String = row.try_get("status").map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(Delegation {
        delegator_address: parse_address(
            &row.try_get::<String, _>("delegator_address")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        )?,
        dao_governor: parse_address(
            &row.try_get::<String, _>("dao_governor")
                .map_err(|e| StoreError::Database(e.to_string()))?,
        )?,
        chain_id: row
            .try_get::<i64, _>("chain_id")
            .map_err(|e| StoreError::Database(e.to_string()))? as u64,
        risk_threshold: row
            .try_get("risk_threshold")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        requires_approval: row
            .try_get("requires_approval")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        status: parse_delegation_status(&status_raw)?,
        last_event_block: row
            .try_get::<i64, _>("last_event_block")
            .map_err(|e| StoreError::Database(e.to_string()))? as u64,
        last_event_tx_hash: row
            .try_get("last_event_tx_hash")
            .map_err(|e| StoreError::Database(e.to_string()))?,
        revoke_tx_hash: row
            .try_get("revoke_tx_hash")
            .map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

/// Typed repository operations over the four owned tables. Kept free of a
/// generic `save` so regressing a status requires explicitly bypassing
/// `transition_proposal_status`, not a caller forgetting a check.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Returns the stored row plus whether this call inserted it. On a
    /// conflict (replay of an already-known onchain id/governor/chain
    /// triple) the row is refreshed but `inserted` is `false`, so callers
    /// can skip appending a duplicate detection audit entry.
    async fn upsert_proposal(&self, proposal: &Proposal) -> Result<(Proposal, bool), StoreError>;
    async fn find_proposal_by_onchain_key(&self, key: &ProposalKey) -> Result<Option<Proposal>, StoreError>;
    async fn find_proposal_by_id(&self, id: i64) -> Result<Option<Proposal>, StoreError>;
    async fn transition_proposal_status(
        &self,
        proposal_id: i64,
        from_set: &[ProposalStatus],
        to: ProposalStatus,
    ) -> Result<(), StoreError>;
    /// Returns whether this call inserted a new delegation row, for the
    /// same replay-detection purpose as `upsert_proposal`.
    async fn upsert_delegation(&self, delegation: &Delegation) -> Result<bool, StoreError>;
    /// Returns whether this call actually transitioned a delegation to
    /// REVOKED (`false` for an unknown triple or one already revoked).
    async fn mark_delegation_revoked(
        &self,
        key: &aegis_types::delegation::DelegationKey,
        revoke_tx_hash: &str,
        block: u64,
    ) -> Result<bool, StoreError>;
    async fn list_active_delegations(&self, dao: &Address, chain_id: u64) -> Result<Vec<Delegation>, StoreError>;
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
    async fn bulk_append_audit(&self, entries: &[AuditEntry]) -> Result<(), StoreError>;
    async fn upsert_analysis(&self, analysis: &Analysis) -> Result<(), StoreError>;
    async fn has_successful_vote_cast(&self, proposal_id: i64, delegator: &Address) -> Result<bool, StoreError>;
}

/// The `sqlx`-backed Postgres implementation of [`Repository`].
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn upsert_proposal(&self, proposal: &Proposal) -> Result<(Proposal, bool), StoreError> {
        let targets_json = JsonValue::from(proposal.targets.iter().map(|a| a.to_string()).collect::<Vec<_>>());
        let values_json = JsonValue::from(proposal.values.clone());
        let calldatas_json = JsonValue::from(proposal.calldatas.clone());

        // `xmax = 0` is true only for the row version this statement just
        // inserted; a conflict-triggered update leaves xmax set, which is
        // how a replayed event is told apart from a genuinely new one.
        let row = sqlx::query(
            r#"
            INSERT INTO proposals (
                onchain_proposal_id, dao_governor_address, chain_id, title, description,
                proposer_address, voting_start_block, voting_end_block, targets, values_wei,
                calldatas, detected_at_block, creation_tx_hash, status, composite_risk_score
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (onchain_proposal_id, dao_governor_address, chain_id)
            DO UPDATE SET
                description = EXCLUDED.description,
                title = EXCLUDED.title,
                updated_at = now()
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(&proposal.onchain_proposal_id)
        .bind(proposal.dao_governor_address.to_string())
        .bind(proposal.chain_id as i64)
        .bind(&proposal.title)
        .bind(&proposal.description)
        .bind(proposal.proposer_address.to_string())
        .bind(proposal.voting_start_block as i64)
        .bind(proposal.voting_end_block as i64)
        .bind(targets_json)
        .bind(values_json)
        .bind(calldatas_json)
        .bind(proposal.detected_at_block as i64)
        .bind(&proposal.creation_tx_hash)
        .bind(proposal.status.to_string())
        .bind(proposal.composite_risk_score)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let inserted: bool = row.try_get("inserted").map_err(|e| StoreError::Database(e.to_string()))?;
        Ok((row_to_proposal(&row)?, inserted))
    }

    async fn find_proposal_by_onchain_key(&self, key: &ProposalKey) -> Result<Option<Proposal>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM proposals WHERE onchain_proposal_id = $1 AND dao_governor_address = $2 AND chain_id = $3",
        )
        .bind(&key.onchain_proposal_id)
        .bind(key.dao_governor_address.to_string())
        .bind(key.chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_proposal).transpose()
    }

    async fn find_proposal_by_id(&self, id: i64) -> Result<Option<Proposal>, StoreError> {
        let row = sqlx::query("SELECT * FROM proposals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_proposal).transpose()
    }

    async fn transition_proposal_status(
        &self,
        proposal_id: i64,
        from_set: &[ProposalStatus],
        to: ProposalStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let current_raw: Option<String> = sqlx::query_scalar("SELECT status FROM proposals WHERE id = $1 FOR UPDATE")
            .bind(proposal_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let current_raw = current_raw.ok_or_else(|| StoreError::ProposalNotFound(proposal_id.to_string()))?;
        let current = parse_status(&current_raw)?;

        if !from_set.contains(&current) || !current.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }

        sqlx::query("UPDATE proposals SET status = $1, updated_at = now() WHERE id = $2")
            .bind(to.to_string())
            .bind(proposal_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn upsert_delegation(&self, delegation: &Delegation) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO delegations (
                delegator_address, dao_governor, chain_id, risk_threshold, requires_approval,
                status, last_event_block, last_event_tx_hash, revoke_tx_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (delegator_address, dao_governor, chain_id)
            DO UPDATE SET
                risk_threshold = EXCLUDED.risk_threshold,
                requires_approval = EXCLUDED.requires_approval,
                status = EXCLUDED.status,
                last_event_block = EXCLUDED.last_event_block,
                last_event_tx_hash = EXCLUDED.last_event_tx_hash,
                revoke_tx_hash = EXCLUDED.revoke_tx_hash,
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(delegation.delegator_address.to_string())
        .bind(delegation.dao_governor.to_string())
        .bind(delegation.chain_id as i64)
        .bind(delegation.risk_threshold)
        .bind(delegation.requires_approval)
        .bind(delegation.status.to_string())
        .bind(delegation.last_event_block as i64)
        .bind(&delegation.last_event_tx_hash)
        .bind(&delegation.revoke_tx_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        row.try_get("inserted").map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn mark_delegation_revoked(
        &self,
        key: &aegis_types::delegation::DelegationKey,
        revoke_tx_hash: &str,
        block: u64,
    ) -> Result<bool, StoreError> {
        // §3: "a revoke event for an unknown triple is logged and ignored,
        // not an error" -- an affected-rows check, not a row-must-exist one.
        // Excluding already-REVOKED rows from the WHERE clause makes a
        // replayed revoke event affect zero rows too, so the caller can
        // skip appending a duplicate audit entry the same way it does for
        // an unknown triple.
        let result = sqlx::query(
            r#"
            UPDATE delegations
            SET status = 'REVOKED', revoke_tx_hash = $1, last_event_block = $2, last_event_tx_hash = $1, updated_at = now()
            WHERE delegator_address = $3 AND dao_governor = $4 AND chain_id = $5 AND status != 'REVOKED'
            "#,
        )
        .bind(revoke_tx_hash)
        .bind(block as i64)
        .bind(key.delegator_address.to_string())
        .bind(key.dao_governor.to_string())
        .bind(key.chain_id as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tracing::info!(
                delegator = %key.delegator_address,
                dao = %key.dao_governor,
                chain_id = key.chain_id,
                "ignoring revoke for unknown or already-revoked delegation"
            );
            Ok(false)
        } else {
            Ok(true)
        }
    }

    async fn list_active_delegations(&self, dao: &Address, chain_id: u64) -> Result<Vec<Delegation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM delegations WHERE dao_governor = $1 AND chain_id = $2 AND status = 'ACTIVE'")
            .bind(dao.to_string())
            .bind(chain_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_delegation).collect()
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        insert_audit(&self.pool, entry).await
    }

    async fn bulk_append_audit(&self, entries: &[AuditEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;
        for entry in entries {
            insert_audit(&mut *tx, entry).await?;
        }
        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn upsert_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let current_status_raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM proposals WHERE id = $1 FOR UPDATE")
                .bind(analysis.proposal_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let current_status_raw =
            current_status_raw.ok_or_else(|| StoreError::ProposalNotFound(analysis.proposal_id.to_string()))?;
        let current_status = parse_status(&current_status_raw)?;

        let already_scored: Option<i32> =
            sqlx::query_scalar("SELECT composite_risk_score FROM proposals WHERE id = $1")
                .bind(analysis.proposal_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

        // §3: "once a composite risk score is set it is never overwritten
        // for the same proposal unless status is PENDING_ANALYSIS."
        if already_scored.is_some() && current_status != ProposalStatus::PendingAnalysis {
            return Err(StoreError::AnalysisAlreadySet(analysis.proposal_id.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO analyses (proposal_id, analysis_id, composite_risk_score, risk_level, recommendation, report_hash, processing_time_ms, model_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (proposal_id) DO UPDATE SET
                analysis_id = EXCLUDED.analysis_id,
                composite_risk_score = EXCLUDED.composite_risk_score,
                risk_level = EXCLUDED.risk_level,
                recommendation = EXCLUDED.recommendation,
                report_hash = EXCLUDED.report_hash,
                processing_time_ms = EXCLUDED.processing_time_ms,
                model_version = EXCLUDED.model_version
            "#,
        )
        .bind(analysis.proposal_id)
        .bind(&analysis.analysis_id)
        .bind(analysis.composite_risk_score)
        .bind(analysis.risk_level.to_string())
        .bind(analysis.recommendation.to_string())
        .bind(analysis.report_hash.as_slice())
        .bind(analysis.processing_time_ms)
        .bind(&analysis.model_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query("UPDATE proposals SET composite_risk_score = $1, updated_at = now() WHERE id = $2")
            .bind(analysis.composite_risk_score)
            .bind(analysis.proposal_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn has_successful_vote_cast(&self, proposal_id: i64, delegator: &Address) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM audit_log WHERE proposal_id = $1 AND delegator_address = $2 AND action = 'AUTO_VOTE_CAST' AND tx_hash IS NOT NULL",
        )
        .bind(proposal_id)
        .bind(delegator.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(count > 0)
    }
}

async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_log (
            action, proposal_id, dao_governor, delegator_address, vote_direction,
            risk_score_at_decision, tx_hash, was_auto_vote, metadata, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.action.to_string())
    .bind(entry.proposal_id)
    .bind(entry.dao_governor.to_string())
    .bind(entry.delegator_address.as_ref().map(|a| a.to_string()))
    .bind(entry.vote_direction.as_ref().map(|d| d.to_string()))
    .bind(entry.risk_score_at_decision)
    .bind(&entry.tx_hash)
    .bind(entry.was_auto_vote)
    .bind(&entry.metadata)
    .bind(entry.created_at)
    .execute(executor)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(())
}
