//! Job status notifications
//!
//! Every persisted progress flush is followed by a status message so callers
//! can watch a job without polling the store.

use anyhow::Result;
use async_nats::Client;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{Job, JobStatusUpdate};

/// Status updates for job `<id>` are published on `<prefix>.<id>`
pub const SUBJECT_STATUS_PREFIX: &str = "leadflow.job.status";

pub fn status_subject(job_id: uuid::Uuid) -> String {
    format!("{}.{}", SUBJECT_STATUS_PREFIX, job_id)
}

#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify(&self, job: &Job) -> Result<()>;
}

/// Publishes `JobStatusUpdate` on the job's NATS status subject
pub struct NatsNotifier {
    client: Client,
}

impl NatsNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobNotifier for NatsNotifier {
    async fn notify(&self, job: &Job) -> Result<()> {
        let update = JobStatusUpdate::new(job.clone());
        let payload = serde_json::to_vec(&update)?;
        self.client
            .publish(status_subject(job.id), payload.into())
            .await?;
        Ok(())
    }
}

/// In-process fan-out, used by the CLI and by tests
pub struct BroadcastNotifier {
    sender: broadcast::Sender<JobStatusUpdate>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobStatusUpdate> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl JobNotifier for BroadcastNotifier {
    async fn notify(&self, job: &Job) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender.send(JobStatusUpdate::new(job.clone()));
        Ok(())
    }
}
