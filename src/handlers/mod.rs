//! NATS message handlers

pub mod jobs;
pub mod ping;
pub mod upload;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::select;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::EngineError;
use crate::services::supervisor::JobSupervisor;
use crate::types::{ErrorResponse, Request, SuccessResponse};

pub const SUBJECT_PING: &str = "leadflow.ping";
pub const SUBJECT_JOB_CREATE: &str = "leadflow.job.create";
pub const SUBJECT_JOB_PAUSE: &str = "leadflow.job.pause";
pub const SUBJECT_JOB_RESUME: &str = "leadflow.job.resume";
pub const SUBJECT_JOB_CANCEL: &str = "leadflow.job.cancel";
pub const SUBJECT_JOB_GET: &str = "leadflow.job.get";
pub const SUBJECT_JOB_LIST: &str = "leadflow.job.list";
pub const SUBJECT_UPLOAD: &str = "leadflow.upload";

/// Subscribe to every subject and serve until one handler stops
pub async fn start_handlers(
    client: Client,
    supervisor: Arc<JobSupervisor>,
    config: &Config,
) -> Result<()> {
    info!("Starting message handlers...");

    let ping_sub = client.subscribe(SUBJECT_PING).await?;
    let create_sub = client.subscribe(SUBJECT_JOB_CREATE).await?;
    let pause_sub = client.subscribe(SUBJECT_JOB_PAUSE).await?;
    let resume_sub = client.subscribe(SUBJECT_JOB_RESUME).await?;
    let cancel_sub = client.subscribe(SUBJECT_JOB_CANCEL).await?;
    let get_sub = client.subscribe(SUBJECT_JOB_GET).await?;
    let list_sub = client.subscribe(SUBJECT_JOB_LIST).await?;
    let upload_sub = client.subscribe(SUBJECT_UPLOAD).await?;

    info!("Subscribed to leadflow.* subjects");

    let ping_handle = tokio::spawn(ping::handle_ping(client.clone(), ping_sub, supervisor.clone()));
    let create_handle = tokio::spawn(jobs::handle_create(
        client.clone(),
        create_sub,
        supervisor.clone(),
        config.upload_dir.clone(),
    ));
    let pause_handle = tokio::spawn(jobs::handle_pause(client.clone(), pause_sub, supervisor.clone()));
    let resume_handle = tokio::spawn(jobs::handle_resume(client.clone(), resume_sub, supervisor.clone()));
    let cancel_handle = tokio::spawn(jobs::handle_cancel(client.clone(), cancel_sub, supervisor.clone()));
    let get_handle = tokio::spawn(jobs::handle_get(client.clone(), get_sub, supervisor.clone()));
    let list_handle = tokio::spawn(jobs::handle_list(client.clone(), list_sub, supervisor));
    let upload_handle = tokio::spawn(upload::handle_upload(
        client,
        upload_sub,
        config.upload_dir.clone(),
        config.max_upload_bytes,
    ));

    select! {
        result = ping_handle => error!("Ping handler finished: {:?}", result),
        result = create_handle => error!("Job create handler finished: {:?}", result),
        result = pause_handle => error!("Job pause handler finished: {:?}", result),
        result = resume_handle => error!("Job resume handler finished: {:?}", result),
        result = cancel_handle => error!("Job cancel handler finished: {:?}", result),
        result = get_handle => error!("Job get handler finished: {:?}", result),
        result = list_handle => error!("Job list handler finished: {:?}", result),
        result = upload_handle => error!("Upload handler finished: {:?}", result),
    }

    Ok(())
}

/// Request/reply loop shared by the job control subjects.
///
/// Unparseable requests get `INVALID_REQUEST` with a nil id; engine errors are
/// answered with their `EngineError::code`.
pub(crate) async fn serve_requests<T, R, F, Fut>(
    client: Client,
    mut subscriber: Subscriber,
    operation: &'static str,
    handle: F,
) -> Result<()>
where
    T: DeserializeOwned,
    R: Serialize,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, EngineError>>,
{
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<T> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse {} request: {}", operation, e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };
        debug!("Handling {} request {}", operation, request.id);

        match handle(request.payload).await {
            Ok(payload) => {
                let success = SuccessResponse::new(request.id, payload);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                let error = error_response(request.id, operation, &e);
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

fn error_response(request_id: Uuid, operation: &str, err: &EngineError) -> ErrorResponse {
    match err {
        EngineError::Store(e) => error!("{} failed: {:#}", operation, e),
        other => warn!("{} refused: {}", operation, other),
    }
    ErrorResponse::new(request_id, err.code(), err.to_string())
}
