//! The orchestrator binary: loads configuration, brings up the durable
//! stores, and runs the scanner, job-bus sweeper, and vote executor as
//! cooperating tasks behind one shutdown signal.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;

use aegis_chain::Scanner;
use aegis_executor::{EthersVoteBackend, ResultListener, SigningDisabledBackend, VoteBackend, VoteExecutor};
use aegis_queue::{run_stall_sweeper, AnalysisQueue, RedisQueueBackend};
use aegis_store::db::PgRepository;
use aegis_store::kv::RedisKv;
use aegis_types::address::Address;
use aegis_types::config::OrchestratorConfig;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Provider, Ws};
use ethers::signers::{LocalWallet, Signer};

#[derive(Parser, Debug)]
#[clap(name = "aegis-node", about = "AEGIS risk-aware auto-voting orchestrator")]
struct Opts {
    #[clap(long, default_value = "./aegis.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    aegis_telemetry::init::init_tracing()?;

    let opts = Opts::parse();
    let raw = fs::read_to_string(&opts.config)
        .with_context(|| format!("reading config file at {}", opts.config.display()))?;
    let config: OrchestratorConfig = toml::from_str(&raw).context("parsing config file")?;
    config.validate().context("invalid configuration, refusing to start")?;

    let sink = aegis_telemetry::prometheus::install()?;
    aegis_telemetry::prometheus::install_global()?;
    let readiness = aegis_telemetry::http::Readiness::new();
    let telemetry_addr: SocketAddr = config.telemetry_addr.parse().context("parsing telemetry_addr")?;
    {
        let readiness = readiness.clone();
        tokio::spawn(async move { aegis_telemetry::http::serve(telemetry_addr, sink, readiness).await });
    }

    let kv = Arc::new(RedisKv::connect(&config.redis_url).await?);
    let queue_backend = Arc::new(RedisQueueBackend::connect(&config.redis_url).await?);
    let repo = Arc::new(PgRepository::connect(&config.database_url).await?);
    repo.migrate().await?;

    let queue = Arc::new(AnalysisQueue::new(queue_backend.clone(), config.job_retry_attempts, config.job_stall_timeout_ms));

    let (shutdown_tx, _) = broadcast::channel(1);

    let scanner = Scanner::new(config.clone(), repo.clone(), kv.clone(), queue.clone());
    let scanner_handle = tokio::spawn(scanner.run(shutdown_tx.subscribe()));

    let sweeper_handle = tokio::spawn(run_stall_sweeper(
        queue_backend.clone(),
        config.job_stall_timeout_ms,
        shutdown_tx.subscribe(),
    ));

    let backend: Arc<dyn VoteBackend> = match &config.backend_private_key {
        Some(private_key) => {
            let provider = Provider::<Ws>::connect(&config.rpc_url).await.context("connecting signer provider")?;
            let wallet: LocalWallet = private_key.parse().context("parsing backend_private_key")?;
            let wallet = wallet.with_chain_id(config.chain_id);
            let client = Arc::new(SignerMiddleware::new(provider, wallet));
            let voting_agent = Address::parse(&config.voting_agent_address).context("parsing voting_agent_address")?;
            Arc::new(EthersVoteBackend::new(&voting_agent, client))
        }
        None => {
            tracing::warn!("backend_private_key not configured, voting is disabled for this deployment");
            Arc::new(SigningDisabledBackend)
        }
    };

    let executor = Arc::new(VoteExecutor::new(repo.clone(), backend));
    let listener = ResultListener::new(kv.clone(), executor, config.executor_concurrency);
    let listener_handle = tokio::spawn(listener.run(shutdown_tx.subscribe()));

    readiness.mark_ready();
    tracing::info!("aegis-node started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(());

    let grace = tokio::time::Duration::from_millis(config.shutdown_grace_ms);
    let drain = async {
        let _ = scanner_handle.await;
        let _ = sweeper_handle.await;
        let _ = listener_handle.await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("shutdown grace period elapsed before all tasks drained");
    }

    tracing::info!("aegis-node stopped");
    Ok(())
}
