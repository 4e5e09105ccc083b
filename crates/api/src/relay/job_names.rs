//! Names clients give their jobs, held until the engine starts the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Entry {
    name: String,
    inserted_at: Instant,
}

/// Bounded job id → name map shared by all sessions.
///
/// Entries older than the TTL are dropped on the next insert or lookup.
/// When full, the oldest entry makes room for the new one.
pub struct JobNameRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    capacity: usize,
    ttl: Duration,
}

impl JobNameRegistry {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record the name of a freshly submitted job.
    pub async fn insert(&self, job_id: &str, name: &str) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.inserted_at) < self.ttl);

        if entries.len() >= self.capacity && !entries.contains_key(job_id) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(job_id = %oldest, "Evicting job name to stay within capacity");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            job_id.to_string(),
            Entry {
                name: name.to_string(),
                inserted_at: now,
            },
        );
    }

    /// Insert a name that lives until the returned guard is dropped.
    pub async fn register(self: &Arc<Self>, job_id: &str, name: &str) -> JobNameGuard {
        self.insert(job_id, name).await;
        JobNameGuard {
            registry: Arc::clone(self),
            job_id: job_id.to_string(),
        }
    }

    /// Read and remove a job's name.
    pub async fn take(&self, job_id: &str) -> Option<String> {
        let entry = self.entries.lock().await.remove(job_id)?;
        (entry.inserted_at.elapsed() < self.ttl).then_some(entry.name)
    }

    pub async fn remove(&self, job_id: &str) {
        self.entries.lock().await.remove(job_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Removes a job's name from the registry when dropped.
///
/// Sessions aborted mid-await still release their entry.
pub struct JobNameGuard {
    registry: Arc<JobNameRegistry>,
    job_id: String,
}

impl Drop for JobNameGuard {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.registry.entries.try_lock() {
            entries.remove(&self.job_id);
            return;
        }
        // Lock is busy, finish the removal on the runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let job_id = std::mem::take(&mut self.job_id);
            handle.spawn(async move { registry.remove(&job_id).await });
        }
    }
}
