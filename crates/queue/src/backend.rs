//! The Redis-backed FIFO lanes and lease bookkeeping underlying the job
//! bus. Kept separate from `aegis_store::kv`'s C1 surface since lanes and
//! leases are an implementation detail of C4, not part of the cursor/lock
//! key space named in the data model.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};

use aegis_types::error::KvError;

fn lane_key(lane: &str) -> String {
    format!("queue:lane:{lane}")
}

fn job_key(id: i64) -> String {
    format!("queue:job:{id}")
}

fn lease_key(id: i64) -> String {
    format!("queue:lease:{id}")
}

/// The object-safe surface the job bus operates against, so its retry
/// and stall-sweep logic can be exercised without a live Redis instance.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Stores the job descriptor at `queue:job:{id}` only if absent.
    /// Returns `true` if this call created it (first enqueue).
    async fn store_job_if_absent(&self, id: i64, json: &str) -> Result<bool, KvError>;
    async fn load_job(&self, id: i64) -> Result<Option<String>, KvError>;
    async fn delete_job(&self, id: i64) -> Result<(), KvError>;
    async fn push_lane(&self, lane: &str, id: i64) -> Result<(), KvError>;
    /// Pops the oldest id off the lane, or `None` if empty.
    async fn pop_lane(&self, lane: &str) -> Result<Option<i64>, KvError>;
    async fn remove_from_lane(&self, lane: &str, id: i64) -> Result<(), KvError>;
    async fn lane_depth(&self, lane: &str) -> Result<u64, KvError>;
    async fn set_lease(&self, id: i64, json: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn get_lease(&self, id: i64) -> Result<Option<String>, KvError>;
    async fn clear_lease(&self, id: i64) -> Result<(), KvError>;
    /// Scans for lease keys whose TTL has lapsed. A plain key scan with a
    /// short TTL already expires leases server-side; this enumerates the
    /// survivors still tracked for bookkeeping (e.g. in a fake backend in
    /// tests) rather than relying on Redis's own expiry notifications.
    async fn all_lease_ids(&self) -> Result<Vec<i64>, KvError>;
}

#[derive(Clone)]
pub struct RedisQueueBackend {
    manager: ConnectionManager,
}

impl RedisQueueBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = Client::open(redis_url).map_err(|e| KvError::Connection(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn store_job_if_absent(&self, id: i64, json: &str) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let set: bool = conn
            .set_nx(job_key(id), json)
            .await
            .map_err(|e| KvError::Command(e.to_string()))?;
        Ok(set)
    }

    async fn load_job(&self, id: i64) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.get(job_key(id)).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn delete_job(&self, id: i64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.del(job_key(id)).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn push_lane(&self, lane: &str, id: i64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.rpush(lane_key(lane), id)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn pop_lane(&self, lane: &str) -> Result<Option<i64>, KvError> {
        let mut conn = self.manager.clone();
        conn.lpop(lane_key(lane), None)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn remove_from_lane(&self, lane: &str, id: i64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .lrem(lane_key(lane), 0, id)
            .await
            .map_err(|e| KvError::Command(e.to_string()))?;
        Ok(())
    }

    async fn lane_depth(&self, lane: &str) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        conn.llen(lane_key(lane)).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn set_lease(&self, id: i64, json: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.set_ex(lease_key(id), json, ttl_secs)
            .await
            .map_err(|e| KvError::Command(e.to_string()))
    }

    async fn get_lease(&self, id: i64) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        conn.get(lease_key(id)).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn clear_lease(&self, id: i64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        conn.del(lease_key(id)).await.map_err(|e| KvError::Command(e.to_string()))
    }

    async fn all_lease_ids(&self) -> Result<Vec<i64>, KvError> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn
            .keys("queue:lease:*")
            .await
            .map_err(|e| KvError::Command(e.to_string()))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("queue:lease:").and_then(|id| id.parse().ok()))
            .collect())
    }
}
