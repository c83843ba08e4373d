//! The on-chain call surface the pipeline casts votes through. Abstracted
//! behind a trait so the batch/fallback logic in [`crate::pipeline`] can be
//! exercised without a live signer, and so a missing `backend_private_key`
//! (§6) degrades to an explicit no-op rather than a panic.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address as EthAddress, U256};

use aegis_chain::abi::VotingAgentContract;
use aegis_types::address::Address;
use aegis_types::audit::VoteDirection;

/// Casts votes on the voting-agent contract. Every method returns the
/// submitted transaction's hash on success (so the caller can record it
/// on the audit entry and make the idempotency check at
/// `Repository::has_successful_vote_cast` meaningful) or the revert
/// reason (or transport error message) as a plain string on failure,
/// matching §4.5's substring-classification rule.
#[async_trait]
pub trait VoteBackend: Send + Sync {
    async fn cast_multiple_votes(
        &self,
        dao_governor: &Address,
        proposal_ids: &[String],
        delegators: &[Address],
        directions: &[VoteDirection],
        scores_bps: &[u64],
        report_hashes: &[[u8; 32]],
    ) -> Result<String, String>;

    async fn cast_vote_with_risk(
        &self,
        proposal_id: &str,
        delegator: &Address,
        direction: VoteDirection,
        score_bps: u64,
        report_hash: [u8; 32],
    ) -> Result<String, String>;
}

fn to_eth_address(addr: &Address) -> EthAddress {
    addr.as_str().parse().expect("validated address parses as an eth address")
}

fn to_u256(proposal_id: &str) -> Result<U256, String> {
    U256::from_dec_str(proposal_id).map_err(|e| format!("malformed on-chain proposal id: {e}"))
}

/// The live backend: signs and submits transactions via `ethers`. A
/// staticcall (`.call()`) precedes every `.send()` so a revert surfaces
/// its reason without spending gas on a transaction known to fail.
pub struct EthersVoteBackend<M: Middleware> {
    contract: VotingAgentContract<M>,
}

impl<M: Middleware + 'static> EthersVoteBackend<M> {
    pub fn new(voting_agent_address: &Address, client: Arc<M>) -> Self {
        Self {
            contract: VotingAgentContract::new(to_eth_address(voting_agent_address), client),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> VoteBackend for EthersVoteBackend<M> {
    async fn cast_multiple_votes(
        &self,
        dao_governor: &Address,
        proposal_ids: &[String],
        delegators: &[Address],
        directions: &[VoteDirection],
        scores_bps: &[u64],
        report_hashes: &[[u8; 32]],
    ) -> Result<String, String> {
        let ids = proposal_ids.iter().map(|id| to_u256(id)).collect::<Result<Vec<_>, _>>()?;
        let dels: Vec<EthAddress> = delegators.iter().map(to_eth_address).collect();
        let supports: Vec<u8> = directions.iter().map(|d| d.as_contract_u8()).collect();
        let scores: Vec<U256> = scores_bps.iter().copied().map(U256::from).collect();
        let hashes: Vec<[u8; 32]> = report_hashes.to_vec();

        let call = self
            .contract
            .cast_multiple_votes(to_eth_address(dao_governor), ids, dels, supports, scores, hashes);

        call.call().await.map_err(|e| e.to_string())?;
        let pending = call.send().await.map_err(|e| e.to_string())?;
        let tx_hash = format!("{:#x}", *pending);
        pending.await.map_err(|e| e.to_string())?;
        Ok(tx_hash)
    }

    async fn cast_vote_with_risk(
        &self,
        proposal_id: &str,
        delegator: &Address,
        direction: VoteDirection,
        score_bps: u64,
        report_hash: [u8; 32],
    ) -> Result<String, String> {
        let id = to_u256(proposal_id)?;
        let call = self.contract.cast_vote_with_risk(
            id,
            to_eth_address(delegator),
            direction.as_contract_u8(),
            U256::from(score_bps),
            report_hash,
        );

        call.call().await.map_err(|e| e.to_string())?;
        let pending = call.send().await.map_err(|e| e.to_string())?;
        let tx_hash = format!("{:#x}", *pending);
        pending.await.map_err(|e| e.to_string())?;
        Ok(tx_hash)
    }
}

/// §6: "`backend_private_key` optional; disables voting when absent."
/// Every call fails immediately with a reason that never matches any
/// `VoteErrorCode` substring pattern except the `UNKNOWN_ERROR` catch-all,
/// which the pipeline special-cases into an explicit "signing disabled"
/// audit entry rather than a misleading on-chain error code.
pub struct SigningDisabledBackend;

/// Shared verbatim between this backend and the pipeline's failure
/// handling so the pipeline can recognize this specific case by equality
/// rather than running it through `VoteErrorCode::classify`.
pub const SIGNING_DISABLED_REASON: &str = "signing disabled: backend_private_key not configured";

#[async_trait]
impl VoteBackend for SigningDisabledBackend {
    async fn cast_multiple_votes(
        &self,
        _dao_governor: &Address,
        _proposal_ids: &[String],
        _delegators: &[Address],
        _directions: &[VoteDirection],
        _scores_bps: &[u64],
        _report_hashes: &[[u8; 32]],
    ) -> Result<String, String> {
        Err(SIGNING_DISABLED_REASON.to_string())
    }

    async fn cast_vote_with_risk(
        &self,
        _proposal_id: &str,
        _delegator: &Address,
        _direction: VoteDirection,
        _score_bps: u64,
        _report_hash: [u8; 32],
    ) -> Result<String, String> {
        Err(SIGNING_DISABLED_REASON.to_string())
    }
}
