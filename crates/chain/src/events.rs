//! Plain, chain-library-agnostic shapes the scanner decodes contract logs
//! into before handing them to the event handlers. Keeping handlers
//! against these instead of `ethers`' generated filter types lets them be
//! exercised without a live or mocked RPC provider.

use aegis_types::address::Address;

#[derive(Debug, Clone)]
pub struct ProposalCreatedEvent {
    pub onchain_proposal_id: String,
    pub proposer: Address,
    pub targets: Vec<Address>,
    pub values: Vec<String>,
    pub calldatas: Vec<String>,
    pub start_block: u64,
    pub end_block: u64,
    pub description: String,
    pub block_number: u64,
    pub tx_hash: String,
}

#[derive(Debug, Clone)]
pub struct DelegationGrantedEvent {
    pub user: Address,
    pub dao_governor: Address,
    pub risk_threshold: i32,
    pub block_number: u64,
    pub tx_hash: String,
}

#[derive(Debug, Clone)]
pub struct DelegationRevokedEvent {
    pub user: Address,
    pub dao_governor: Address,
    pub block_number: u64,
    pub tx_hash: String,
}
