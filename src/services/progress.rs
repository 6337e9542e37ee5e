//! Progress reporter
//!
//! Persists the job snapshot (counters, cursor, heartbeat) and then announces
//! it. Flushes are rate-limited to one per heartbeat interval unless forced.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::Instant;
use tracing::warn;

use crate::services::job_store::JobStore;
use crate::services::notifier::JobNotifier;
use crate::types::Job;

pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    interval: Duration,
    last_flush: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn JobNotifier>, interval: Duration) -> Self {
        Self {
            store,
            notifier,
            interval,
            last_flush: None,
        }
    }

    pub fn is_due(&self) -> bool {
        self.last_flush
            .map_or(true, |last| last.elapsed() >= self.interval)
    }

    /// Flush only if the heartbeat interval elapsed
    pub async fn maybe_flush(&mut self, job: &mut Job) -> Result<()> {
        if self.is_due() {
            self.flush(job).await?;
        }
        Ok(())
    }

    /// Persist now. A failed notification is logged, never fatal.
    pub async fn flush(&mut self, job: &mut Job) -> Result<()> {
        let now = Utc::now();
        job.heartbeat_at = Some(now);
        job.updated_at = now;
        self.store.save(job).await?;
        self.last_flush = Some(Instant::now());

        if let Err(e) = self.notifier.notify(job).await {
            warn!("Failed to publish status for job {}: {}", job.id, e);
        }
        Ok(())
    }
}
