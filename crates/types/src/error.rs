//! Error taxonomy for the orchestrator, one enum per component, following
//! §7's propagation policy. Each variant carries a stable machine-readable
//! code via [`ErrorCode`], independent of the `Display` message, so callers
//! can branch on `.code()` without string-matching on human text.

use thiserror::Error;

/// A stable, machine-readable identifier for an error variant.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Errors from the Cursor & Lock Store (C1).
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis connection error: {0}")]
    Connection(String),
    #[error("redis command failed: {0}")]
    Command(String),
    #[error("value at key '{0}' could not be decoded")]
    Decode(String),
}

impl ErrorCode for KvError {
    fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "KV_CONNECTION",
            Self::Command(_) => "KV_COMMAND_FAILED",
            Self::Decode(_) => "KV_DECODE_FAILED",
        }
    }
}

/// Errors from the Relational Store (C2).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: String, to: String },
    #[error("analysis already set for proposal {0}; refusing overwrite")]
    AnalysisAlreadySet(String),
    #[error("proposal not found: {0}")]
    ProposalNotFound(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "STORE_DATABASE_ERROR",
            Self::Kv(_) => "STORE_KV_ERROR",
            Self::InvalidTransition { .. } => "STORE_INVALID_TRANSITION",
            Self::AnalysisAlreadySet(_) => "STORE_ANALYSIS_ALREADY_SET",
            Self::ProposalNotFound(_) => "STORE_PROPOSAL_NOT_FOUND",
        }
    }
}

/// Errors from the Chain Scanner (C3). Transient-transport variants are
/// caught locally by the scanner's own reconnect loop; the rest propagate.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC connection failed: {0}")]
    Rpc(String),
    #[error("RPC call timed out after {0}ms")]
    Timeout(u64),
    #[error("event log had an unexpected shape: {0}")]
    MalformedEvent(String),
    #[error("configuration is invalid: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl ErrorCode for ChainError {
    fn code(&self) -> &'static str {
        match self {
            Self::Rpc(_) => "CHAIN_RPC_ERROR",
            Self::Timeout(_) => "CHAIN_RPC_TIMEOUT",
            Self::MalformedEvent(_) => "CHAIN_MALFORMED_EVENT",
            Self::Configuration(_) => "CHAIN_CONFIGURATION_INVALID",
            Self::Store(_) => "CHAIN_STORE_ERROR",
            Self::Kv(_) => "CHAIN_KV_ERROR",
        }
    }
}

/// Errors from the Analysis Job Bus (C4).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("job {0} exhausted its retry budget")]
    RetriesExhausted(String),
    #[error("analysis event had an unrecognized shape, dropped: {0}")]
    UnrecognizedEvent(String),
}

impl ErrorCode for QueueError {
    fn code(&self) -> &'static str {
        match self {
            Self::Kv(_) => "QUEUE_KV_ERROR",
            Self::JobNotFound(_) => "QUEUE_JOB_NOT_FOUND",
            Self::RetriesExhausted(_) => "QUEUE_RETRIES_EXHAUSTED",
            Self::UnrecognizedEvent(_) => "QUEUE_UNRECOGNIZED_EVENT",
        }
    }
}

/// Errors from the Vote Executor (C5). `VoteErrorCode` (§4.5) classifies
/// individual on-chain call failures; this enum classifies the surrounding
/// orchestration failures.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("on-chain transaction failed: {0}")]
    Transaction(String),
    #[error("signer unavailable: voting is disabled for this deployment")]
    SigningDisabled,
    #[error("array length mismatch building a batch call: {0}")]
    BatchShapeMismatch(String),
}

impl ErrorCode for ExecutorError {
    fn code(&self) -> &'static str {
        match self {
            Self::Store(_) => "EXECUTOR_STORE_ERROR",
            Self::Transaction(_) => "EXECUTOR_TRANSACTION_FAILED",
            Self::SigningDisabled => "EXECUTOR_SIGNING_DISABLED",
            Self::BatchShapeMismatch(_) => "EXECUTOR_BATCH_SHAPE_MISMATCH",
        }
    }
}
