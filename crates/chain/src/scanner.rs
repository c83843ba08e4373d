//! Drives the scanner's state machine against a live RPC endpoint:
//! `starting -> syncing_historical -> live <-> reconnecting -> starting`.
//! §4.3's ordering and cursor-commit rules are implemented here; the event
//! decoding itself is delegated to the handlers in [`crate::handlers`].

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Middleware, Provider, StreamExt, Ws};
use ethers::types::{Address as EthAddress, Bytes, U256};
use tokio::sync::broadcast;
use tokio::time::sleep;

use aegis_queue::AnalysisQueue;
use aegis_store::db::Repository;
use aegis_store::kv::{keys, KvBackend};
use aegis_types::address::Address;
use aegis_types::config::OrchestratorConfig;
use aegis_types::error::ChainError;
use aegis_types::ErrorCode;

use crate::abi::{
    DelegationRevokedFilter, GovernorContract, ProposalCreatedFilter, VotingAgentContract,
    VotingPowerDelegatedFilter,
};
use crate::events::{DelegationGrantedEvent, DelegationRevokedEvent, ProposalCreatedEvent};
use crate::handlers::{handle_delegation_granted, handle_delegation_revoked, handle_proposal_created};
use crate::state::ScannerState;

/// One decoded log plus the ordering key (block, log index within block)
/// needed to dispatch interleaved events from two different contracts in
/// the order they actually happened on-chain.
enum ScannedEvent {
    ProposalCreated(ProposalCreatedEvent),
    DelegationGranted(DelegationGrantedEvent),
    DelegationRevoked(DelegationRevokedEvent),
}

pub struct Scanner {
    config: OrchestratorConfig,
    repo: Arc<dyn Repository>,
    kv: Arc<dyn KvBackend>,
    queue: Arc<AnalysisQueue>,
}

impl Scanner {
    pub fn new(
        config: OrchestratorConfig,
        repo: Arc<dyn Repository>,
        kv: Arc<dyn KvBackend>,
        queue: Arc<AnalysisQueue>,
    ) -> Self {
        Self { config, repo, kv, queue }
    }

    /// Runs until `shutdown` fires. Transient RPC failures move the
    /// scanner to `reconnecting` and retry from `starting`; only invalid
    /// configuration is fatal (§7).
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ChainError> {
        self.config
            .validate()
            .map_err(|e| ChainError::Configuration(e.to_string()))?;

        let dao_governor = Address::parse(&self.config.dao_governor_address)
            .map_err(|e| ChainError::Configuration(e.to_string()))?;
        let voting_agent = Address::parse(&self.config.voting_agent_address)
            .map_err(|e| ChainError::Configuration(e.to_string()))?;

        loop {
            if shutdown.try_recv().is_ok() {
                set_state(ScannerState::Stopped);
                return Ok(());
            }

            set_state(ScannerState::Starting);
            let client = match self.connect().await {
                Ok(c) => c,
                Err(e) => {
                    if self.backoff_or_shutdown(e, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let head = match client.get_block_number().await {
                Ok(n) => n.as_u64(),
                Err(e) => {
                    if self.backoff_or_shutdown(ChainError::Rpc(e.to_string()), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let from_block = match self.resume_from_block().await {
                Ok(n) => n,
                Err(e) => {
                    if self.backoff_or_shutdown(e, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            set_state(ScannerState::SyncingHistorical);
            match self
                .sync_historical(&client, &dao_governor, &voting_agent, from_block, head, &mut shutdown)
                .await
            {
                Ok(true) => return Ok(()), // shutdown requested mid-sync
                Ok(false) => {}
                Err(e) => {
                    if self.backoff_or_shutdown(e, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            }

            set_state(ScannerState::Live);
            match self.run_live(&client, &dao_governor, &voting_agent, head, &mut shutdown).await {
                Ok(()) => return Ok(()), // clean shutdown from inside run_live
                Err(e) => {
                    if self.backoff_or_shutdown(e, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            }
        }
    }

    async fn connect(&self) -> Result<Arc<Provider<Ws>>, ChainError> {
        let provider = Provider::<Ws>::connect(&self.config.rpc_url)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(Arc::new(provider))
    }

    /// §4.3: "`from_block = max(last persisted block + 1, the configured
    /// floor block)`". A missing cursor (first run, or a non-durable KV
    /// that lost it) is treated as "nothing processed yet", i.e. the floor
    /// itself rather than floor + 1.
    async fn resume_from_block(&self) -> Result<u64, ChainError> {
        let floor = self.config.start_block;
        let raw = self.kv.get(&keys::last_block()).await?;
        let from = match raw.and_then(|v| v.parse::<u64>().ok()) {
            Some(last) => last.saturating_add(1),
            None => floor,
        };
        Ok(from.max(floor))
    }

    /// Queries both contracts in `max_block_batch`-sized windows, dispatching
    /// each window's events in block order and committing the cursor only
    /// after the window's handlers all succeed. Returns `Ok(true)` if a
    /// shutdown signal was observed between windows.
    async fn sync_historical(
        &self,
        client: &Arc<Provider<Ws>>,
        dao_governor: &Address,
        voting_agent: &Address,
        from_block: u64,
        head: u64,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool, ChainError> {
        if from_block > head {
            return Ok(false);
        }

        let batch = self.config.max_block_batch;
        let mut window_start = from_block;
        while window_start <= head {
            if shutdown.try_recv().is_ok() {
                return Ok(true);
            }
            let window_end = window_start.saturating_add(batch.saturating_sub(1)).min(head);

            let events = self
                .fetch_window(client, dao_governor, voting_agent, window_start, window_end)
                .await?;

            for event in events {
                self.dispatch(dao_governor, event).await?;
            }

            self.kv.set(&keys::last_block(), &window_end.to_string()).await?;
            aegis_telemetry::chain_metrics().inc_blocks_scanned(window_end - window_start + 1);

            window_start = window_end + 1;
        }
        Ok(false)
    }

    async fn fetch_window(
        &self,
        client: &Arc<Provider<Ws>>,
        dao_governor: &Address,
        voting_agent: &Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<ScannedEvent>, ChainError> {
        let governor_addr = to_eth_address(dao_governor);
        let voting_agent_addr = to_eth_address(voting_agent);

        let governor = GovernorContract::new(governor_addr, Arc::clone(client));
        let voting_agent_contract = VotingAgentContract::new(voting_agent_addr, Arc::clone(client));

        let proposals = governor
            .proposal_created_filter()
            .from_block(from)
            .to_block(to)
            .query_with_meta()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let granted = voting_agent_contract
            .voting_power_delegated_filter()
            .from_block(from)
            .to_block(to)
            .query_with_meta()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let revoked = voting_agent_contract
            .delegation_revoked_filter()
            .from_block(from)
            .to_block(to)
            .query_with_meta()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let mut ordered: Vec<(u64, u64, ScannedEvent)> = Vec::new();
        for (log, meta) in proposals {
            ordered.push((
                meta.block_number.as_u64(),
                meta.log_index.as_u64(),
                ScannedEvent::ProposalCreated(proposal_created_event(log, &meta)),
            ));
        }
        for (log, meta) in granted {
            ordered.push((
                meta.block_number.as_u64(),
                meta.log_index.as_u64(),
                ScannedEvent::DelegationGranted(delegation_granted_event(log, &meta)),
            ));
        }
        for (log, meta) in revoked {
            ordered.push((
                meta.block_number.as_u64(),
                meta.log_index.as_u64(),
                ScannedEvent::DelegationRevoked(delegation_revoked_event(log, &meta)),
            ));
        }
        ordered.sort_by_key(|(block, idx, _)| (*block, *idx));
        Ok(ordered.into_iter().map(|(_, _, e)| e).collect())
    }

    /// Subscribes to both contracts' logs and advances the cursor per
    /// event, since live delivery is already serialized by the provider.
    async fn run_live(
        &self,
        client: &Arc<Provider<Ws>>,
        dao_governor: &Address,
        voting_agent: &Address,
        from_block: u64,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ChainError> {
        let governor_addr = to_eth_address(dao_governor);
        let voting_agent_addr = to_eth_address(voting_agent);

        let governor = GovernorContract::new(governor_addr, Arc::clone(client));
        let voting_agent_contract = VotingAgentContract::new(voting_agent_addr, Arc::clone(client));

        let proposal_created_filter = governor.proposal_created_filter().from_block(from_block);
        let mut proposal_stream = proposal_created_filter
            .stream_with_meta()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let voting_power_delegated_filter = voting_agent_contract
            .voting_power_delegated_filter()
            .from_block(from_block);
        let mut granted_stream = voting_power_delegated_filter
            .stream_with_meta()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let delegation_revoked_filter = voting_agent_contract
            .delegation_revoked_filter()
            .from_block(from_block);
        let mut revoked_stream = delegation_revoked_filter
            .stream_with_meta()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                item = proposal_stream.next() => {
                    match item {
                        Some(Ok((log, meta))) => {
                            let event = proposal_created_event(log, &meta);
                            self.dispatch(dao_governor, ScannedEvent::ProposalCreated(event)).await?;
                            self.advance_cursor(meta.block_number.as_u64()).await?;
                        }
                        Some(Err(e)) => return Err(ChainError::Rpc(e.to_string())),
                        None => return Err(ChainError::Rpc("proposal event stream closed".to_string())),
                    }
                }
                item = granted_stream.next() => {
                    match item {
                        Some(Ok((log, meta))) => {
                            let event = delegation_granted_event(log, &meta);
                            self.dispatch(dao_governor, ScannedEvent::DelegationGranted(event)).await?;
                            self.advance_cursor(meta.block_number.as_u64()).await?;
                        }
                        Some(Err(e)) => return Err(ChainError::Rpc(e.to_string())),
                        None => return Err(ChainError::Rpc("delegation granted stream closed".to_string())),
                    }
                }
                item = revoked_stream.next() => {
                    match item {
                        Some(Ok((log, meta))) => {
                            let event = delegation_revoked_event(log, &meta);
                            self.dispatch(dao_governor, ScannedEvent::DelegationRevoked(event)).await?;
                            self.advance_cursor(meta.block_number.as_u64()).await?;
                        }
                        Some(Err(e)) => return Err(ChainError::Rpc(e.to_string())),
                        None => return Err(ChainError::Rpc("delegation revoked stream closed".to_string())),
                    }
                }
            }
        }
    }

    async fn advance_cursor(&self, block: u64) -> Result<(), ChainError> {
        self.kv.set(&keys::last_block(), &block.to_string()).await?;
        aegis_telemetry::chain_metrics().inc_blocks_scanned(1);
        Ok(())
    }

    async fn dispatch(&self, dao_governor: &Address, event: ScannedEvent) -> Result<(), ChainError> {
        match event {
            ScannedEvent::ProposalCreated(e) => {
                handle_proposal_created(
                    self.repo.as_ref(),
                    self.kv.as_ref(),
                    &self.queue,
                    dao_governor,
                    self.config.chain_id,
                    e,
                )
                .await?;
                aegis_telemetry::chain_metrics().inc_events_handled("proposal_created");
            }
            ScannedEvent::DelegationGranted(e) => {
                handle_delegation_granted(self.repo.as_ref(), self.config.chain_id, e).await?;
                aegis_telemetry::chain_metrics().inc_events_handled("voting_power_delegated");
            }
            ScannedEvent::DelegationRevoked(e) => {
                handle_delegation_revoked(self.repo.as_ref(), self.config.chain_id, e).await?;
                aegis_telemetry::chain_metrics().inc_events_handled("delegation_revoked");
            }
        }
        Ok(())
    }

    /// Logs the failure, flips the state to `reconnecting`, and sleeps for
    /// `reconnect_delay_ms` before the caller loops back to `starting`.
    /// Returns `true` if a shutdown signal arrived during the sleep.
    async fn backoff_or_shutdown(&self, error: ChainError, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tracing::warn!(error = %error, "scanner error, reconnecting");
        set_state(ScannerState::Reconnecting);
        aegis_telemetry::chain_metrics().inc_reconnects();
        aegis_telemetry::error_metrics().inc_error("chain", error.code());
        tokio::select! {
            _ = sleep(Duration::from_millis(self.config.reconnect_delay_ms)) => false,
            _ = shutdown.recv() => true,
        }
    }
}

fn set_state(state: ScannerState) {
    aegis_telemetry::chain_metrics().set_scanner_state(state.metric_name());
}

fn to_eth_address(addr: &Address) -> EthAddress {
    addr.as_str().parse().expect("validated address parses as an eth address")
}

fn to_aegis_address(addr: EthAddress) -> Address {
    Address::parse(&format!("{:#x}", addr)).expect("eth addresses are always well-formed")
}

fn bytes_to_hex(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

fn proposal_created_event(
    log: ProposalCreatedFilter,
    meta: &ethers::contract::LogMeta,
) -> ProposalCreatedEvent {
    ProposalCreatedEvent {
        onchain_proposal_id: log.proposal_id.to_string(),
        proposer: to_aegis_address(log.proposer),
        targets: log.targets.into_iter().map(to_aegis_address).collect(),
        values: log.values.into_iter().map(|v: U256| v.to_string()).collect(),
        calldatas: log.calldatas.iter().map(bytes_to_hex).collect(),
        start_block: log.start_block.as_u64(),
        end_block: log.end_block.as_u64(),
        description: log.description,
        block_number: meta.block_number.as_u64(),
        tx_hash: format!("{:#x}", meta.transaction_hash),
    }
}

fn delegation_granted_event(
    log: VotingPowerDelegatedFilter,
    meta: &ethers::contract::LogMeta,
) -> DelegationGrantedEvent {
    DelegationGrantedEvent {
        user: to_aegis_address(log.user),
        dao_governor: to_aegis_address(log.dao_governor),
        risk_threshold: log.risk_threshold.as_u32() as i32,
        block_number: meta.block_number.as_u64(),
        tx_hash: format!("{:#x}", meta.transaction_hash),
    }
}

fn delegation_revoked_event(
    log: DelegationRevokedFilter,
    meta: &ethers::contract::LogMeta,
) -> DelegationRevokedEvent {
    DelegationRevokedEvent {
        user: to_aegis_address(log.user),
        dao_governor: to_aegis_address(log.dao_governor),
        block_number: meta.block_number.as_u64(),
        tx_hash: format!("{:#x}", meta.transaction_hash),
    }
}
