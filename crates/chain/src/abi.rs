//! Contract bindings for the governor and voting-agent contracts, shared
//! by the scanner (reads events) and the executor (writes votes).

use ethers::prelude::abigen;

abigen!(
    GovernorContract,
    r#"[
        event ProposalCreated(uint256 proposalId, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description)
    ]"#
);

abigen!(
    VotingAgentContract,
    r#"[
        event VotingPowerDelegated(address indexed user, address indexed daoGovernor, uint256 riskThreshold)
        event DelegationRevoked(address indexed user, address indexed daoGovernor)
        function castVoteWithRisk(uint256 proposalId, address delegator, uint8 support, uint256 riskScoreBps, bytes32 reportHash) external returns (bool)
        function castMultipleVotes(address daoGovernor, uint256[] proposalIds, address[] delegators, uint8[] supports, uint256[] riskScoresBps, bytes32[] reportHashes) external returns (bool)
    ]"#
);
