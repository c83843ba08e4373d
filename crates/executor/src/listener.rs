//! Subscribes to `analysis:events:*`, drops everything but `complete`
//! messages, and hands each completed analysis to the [`crate::pipeline`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use aegis_queue::AnalysisEvent;
use aegis_store::kv::{keys, RedisKv};

use crate::pipeline::VoteExecutor;

/// Drives the result-listener task (§4.5): one subscription, a bounded
/// number of concurrent pipeline runs guarded by `concurrency`.
pub struct ResultListener {
    kv: Arc<RedisKv>,
    executor: Arc<VoteExecutor>,
    concurrency: usize,
}

impl ResultListener {
    pub fn new(kv: Arc<RedisKv>, executor: Arc<VoteExecutor>, concurrency: usize) -> Self {
        Self { kv, executor, concurrency }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut pubsub = self.kv.subscribe_pattern(keys::ANALYSIS_EVENTS_WILDCARD).await?;
        let mut stream = pubsub.on_message();
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(pending = in_flight.len(), "result listener shutting down, draining in-flight pipelines");
                    while in_flight.join_next().await.is_some() {}
                    return Ok(());
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("analysis events subscription closed");
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "unreadable pub/sub payload, dropping");
                            continue;
                        }
                    };
                    let Some(event) = AnalysisEvent::parse(&payload) else {
                        continue;
                    };
                    let AnalysisEvent::Complete { analysis } = event else {
                        continue;
                    };

                    let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
                    let executor = Arc::clone(&self.executor);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = executor.process(analysis).await {
                            tracing::error!(error = %e, "vote pipeline failed");
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
    }
}
