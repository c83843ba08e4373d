//! The priority job bus (C4): idempotent enqueue, leasing with a
//! heartbeat-bounded stall window, exponential-backoff retry, and
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use aegis_types::error::QueueError;

use crate::backend::QueueBackend;
use crate::model::{Job, JobPayload, JobPriority};

const RETRY_BASE_MS: u64 = 1_000;
const RETRY_CAP_MS: u64 = 16_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    lane: JobPriority,
    deadline_unix_ms: i64,
}

/// Outcome of reporting a job failure, so the caller knows whether to
/// expect another attempt or treat the proposal as permanently failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    WillRetry { attempt: u32 },
    Exhausted,
}

pub struct AnalysisQueue {
    backend: Arc<dyn QueueBackend>,
    job_retry_attempts: u32,
    job_stall_timeout_ms: u64,
}

impl AnalysisQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, job_retry_attempts: u32, job_stall_timeout_ms: u64) -> Self {
        Self {
            backend,
            job_retry_attempts,
            job_stall_timeout_ms,
        }
    }

    /// §4.4: "the job identifier is the proposal internal identifier
    /// (idempotent — repeated enqueue returns the existing job)."
    pub async fn add_job(&self, id: i64, payload: JobPayload, priority: JobPriority) -> Result<Job, QueueError> {
        if let Some(existing) = self.backend.load_job(id).await? {
            return serde_json::from_str(&existing).map_err(|e| QueueError::UnrecognizedEvent(e.to_string()));
        }

        let job = Job {
            id,
            priority,
            payload,
            attempt: 0,
        };
        let json = serde_json::to_string(&job).expect("job serializes");
        let created = self.backend.store_job_if_absent(id, &json).await?;
        if created {
            self.backend.push_lane(priority.lane_name(), id).await?;
            aegis_telemetry::queue_metrics().inc_jobs_enqueued(priority.lane_name());
        } else if let Some(raced) = self.backend.load_job(id).await? {
            return serde_json::from_str(&raced).map_err(|e| QueueError::UnrecognizedEvent(e.to_string()));
        }
        Ok(job)
    }

    /// Leases the next job across lanes, highest priority first.
    pub async fn lease_next(&self) -> Result<Option<Job>, QueueError> {
        for priority in JobPriority::ALL_IN_ORDER {
            let Some(id) = self.backend.pop_lane(priority.lane_name()).await? else {
                continue;
            };
            let Some(raw) = self.backend.load_job(id).await? else {
                continue; // job was cancelled between pop and load
            };
            let mut job: Job = serde_json::from_str(&raw).map_err(|e| QueueError::UnrecognizedEvent(e.to_string()))?;
            job.attempt += 1;
            let updated = serde_json::to_string(&job).expect("job serializes");
            // `store_job_if_absent` only inserts when missing, so delete
            // first to make this an overwrite of the attempt count.
            self.backend.delete_job(id).await?;
            self.backend.store_job_if_absent(id, &updated).await?;

            let lease = Lease {
                lane: priority,
                deadline_unix_ms: Utc::now().timestamp_millis() + self.job_stall_timeout_ms as i64,
            };
            let lease_json = serde_json::to_string(&lease).expect("lease serializes");
            self.backend
                .set_lease(id, &lease_json, self.job_stall_timeout_ms / 1_000 * 4 + 60)
                .await?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Called by the orchestrator when a `complete` event arrives for
    /// this job id: clears bookkeeping so the stall sweeper never revisits it.
    pub async fn complete_job(&self, id: i64) -> Result<(), QueueError> {
        self.backend.clear_lease(id).await?;
        self.backend.delete_job(id).await?;
        Ok(())
    }

    /// Called on worker-reported failure. Schedules a jittered
    /// exponential-backoff re-enqueue unless the retry budget is spent.
    pub async fn report_failure(&self, job: Job) -> Result<RetryOutcome, QueueError> {
        self.backend.clear_lease(job.id).await?;

        if job.attempt >= self.job_retry_attempts {
            self.backend.delete_job(job.id).await?;
            aegis_telemetry::queue_metrics().inc_jobs_failed();
            return Ok(RetryOutcome::Exhausted);
        }

        aegis_telemetry::queue_metrics().inc_jobs_retried(job.priority.lane_name());
        let delay = backoff_with_full_jitter(job.attempt);
        let backend = Arc::clone(&self.backend);
        let lane = job.priority.lane_name();
        let id = job.id;
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(e) = backend.push_lane(lane, id).await {
                tracing::error!(job_id = id, error = %e, "failed to re-enqueue job after backoff");
            }
        });
        Ok(RetryOutcome::WillRetry { attempt: job.attempt })
    }

    /// §4.4: "removes pending attempts; in-flight attempts are not
    /// interrupted -- their results are simply discarded."
    pub async fn cancel_job(&self, id: i64) -> Result<(), QueueError> {
        for priority in JobPriority::ALL_IN_ORDER {
            self.backend.remove_from_lane(priority.lane_name(), id).await?;
        }
        self.backend.delete_job(id).await?;
        self.backend.clear_lease(id).await?;
        Ok(())
    }

    pub async fn lane_depth(&self, priority: JobPriority) -> Result<u64, QueueError> {
        let depth = self.backend.lane_depth(priority.lane_name()).await?;
        aegis_telemetry::queue_metrics().set_lane_depth(priority.lane_name(), depth as f64);
        Ok(depth)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }
}

fn backoff_with_full_jitter(attempt: u32) -> Duration {
    let capped = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(8)).min(RETRY_CAP_MS);
    let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
    Duration::from_millis(jittered)
}

/// Background task that requeues leases whose deadline has lapsed
/// without the job completing or failing. Runs every
/// `job_stall_timeout_ms / 2`, per §5.
pub async fn run_stall_sweeper(backend: Arc<dyn QueueBackend>, job_stall_timeout_ms: u64, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_millis((job_stall_timeout_ms / 2).max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = sweep_once(&backend).await {
                    tracing::error!(error = %e, "stall sweep pass failed");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("stall sweeper shutting down");
                return;
            }
        }
    }
}

async fn sweep_once(backend: &Arc<dyn QueueBackend>) -> Result<(), QueueError> {
    let now = Utc::now().timestamp_millis();
    for id in backend.all_lease_ids().await? {
        let Some(raw) = backend.get_lease(id).await? else {
            continue;
        };
        let Ok(lease) = serde_json::from_str::<Lease>(&raw) else {
            continue;
        };
        if lease.deadline_unix_ms > now {
            continue;
        }
        backend.clear_lease(id).await?;
        backend.push_lane(lease.lane.lane_name(), id).await?;
        aegis_telemetry::queue_metrics().inc_jobs_stalled();
        tracing::warn!(job_id = id, "reclaimed stalled lease, returned to queue");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        jobs: Mutex<std::collections::HashMap<i64, String>>,
        lanes: Mutex<std::collections::HashMap<String, Vec<i64>>>,
        leases: Mutex<std::collections::HashMap<i64, String>>,
    }

    #[async_trait]
    impl QueueBackend for FakeBackend {
        async fn store_job_if_absent(&self, id: i64, json: &str) -> Result<bool, aegis_types::error::KvError> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&id) {
                jobs.insert(id, json.to_string());
                Ok(false)
            } else {
                jobs.insert(id, json.to_string());
                Ok(true)
            }
        }
        async fn load_job(&self, id: i64) -> Result<Option<String>, aegis_types::error::KvError> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }
        async fn delete_job(&self, id: i64) -> Result<(), aegis_types::error::KvError> {
            self.jobs.lock().unwrap().remove(&id);
            Ok(())
        }
        async fn push_lane(&self, lane: &str, id: i64) -> Result<(), aegis_types::error::KvError> {
            self.lanes.lock().unwrap().entry(lane.to_string()).or_default().push(id);
            Ok(())
        }
        async fn pop_lane(&self, lane: &str) -> Result<Option<i64>, aegis_types::error::KvError> {
            let mut lanes = self.lanes.lock().unwrap();
            let v = lanes.entry(lane.to_string()).or_default();
            if v.is_empty() {
                Ok(None)
            } else {
                Ok(Some(v.remove(0)))
            }
        }
        async fn remove_from_lane(&self, lane: &str, id: i64) -> Result<(), aegis_types::error::KvError> {
            let mut lanes = self.lanes.lock().unwrap();
            if let Some(v) = lanes.get_mut(lane) {
                v.retain(|x| *x != id);
            }
            Ok(())
        }
        async fn lane_depth(&self, lane: &str) -> Result<u64, aegis_types::error::KvError> {
            Ok(self.lanes.lock().unwrap().get(lane).map(|v| v.len()).unwrap_or(0) as u64)
        }
        async fn set_lease(&self, id: i64, json: &str, _ttl_secs: u64) -> Result<(), aegis_types::error::KvError> {
            self.leases.lock().unwrap().insert(id, json.to_string());
            Ok(())
        }
        async fn get_lease(&self, id: i64) -> Result<Option<String>, aegis_types::error::KvError> {
            Ok(self.leases.lock().unwrap().get(&id).cloned())
        }
        async fn clear_lease(&self, id: i64) -> Result<(), aegis_types::error::KvError> {
            self.leases.lock().unwrap().remove(&id);
            Ok(())
        }
        async fn all_lease_ids(&self) -> Result<Vec<i64>, aegis_types::error::KvError> {
            Ok(self.leases.lock().unwrap().keys().copied().collect())
        }
    }

    fn payload() -> JobPayload {
        JobPayload {
            onchain_proposal_id: "42".to_string(),
            dao_governor: "0x1111111111111111111111111111111111111111".to_string(),
            chain_id: 1,
            proposer: "0x2222222222222222222222222222222222222222".to_string(),
            title: "Test".to_string(),
            description: "Test".to_string(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn add_job_is_idempotent() {
        let backend = Arc::new(FakeBackend::default());
        let queue = AnalysisQueue::new(backend, 3, 30_000);
        let a = queue.add_job(1, payload(), JobPriority::High).await.unwrap();
        let b = queue.add_job(1, payload(), JobPriority::High).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(queue.lane_depth(JobPriority::High).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lease_next_drains_high_before_normal() {
        let backend = Arc::new(FakeBackend::default());
        let queue = AnalysisQueue::new(backend, 3, 30_000);
        queue.add_job(1, payload(), JobPriority::Normal).await.unwrap();
        queue.add_job(2, payload(), JobPriority::High).await.unwrap();
        let leased = queue.lease_next().await.unwrap().unwrap();
        assert_eq!(leased.id, 2);
    }

    #[tokio::test]
    async fn retries_exhaust_after_configured_attempts() {
        let backend = Arc::new(FakeBackend::default());
        let queue = AnalysisQueue::new(backend, 1, 30_000);
        queue.add_job(1, payload(), JobPriority::High).await.unwrap();
        let job = queue.lease_next().await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        let outcome = queue.report_failure(job).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Exhausted);
    }

    #[tokio::test]
    async fn cancel_removes_pending_job() {
        let backend = Arc::new(FakeBackend::default());
        let queue = AnalysisQueue::new(backend, 3, 30_000);
        queue.add_job(1, payload(), JobPriority::Low).await.unwrap();
        queue.cancel_job(1).await.unwrap();
        assert_eq!(queue.lane_depth(JobPriority::Low).await.unwrap(), 0);
        assert!(queue.backend().load_job(1).await.unwrap().is_none());
    }
}
