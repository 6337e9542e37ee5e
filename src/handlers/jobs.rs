//! Job control handlers: create, pause, resume, cancel, get and list

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};

use super::serve_requests;
use crate::error::EngineError;
use crate::services::supervisor::JobSupervisor;
use crate::services::uploads::is_stored_upload;
use crate::types::{
    CreateJobRequest, SourceLocator, CreateJobResponse, JobControlResponse, JobHistoryRequest,
    JobHistoryResponse, JobIdRequest,
};

/// File sources submitted over NATS must point at a stored upload
fn check_file_source(request: &CreateJobRequest, upload_dir: &Path) -> Result<(), EngineError> {
    match &request.source {
        SourceLocator::File { path, .. } if !is_stored_upload(Path::new(path), upload_dir) => {
            Err(EngineError::InvalidRequest(format!(
                "{} is not an upload under {}",
                path,
                upload_dir.display()
            )))
        }
        _ => Ok(()),
    }
}

/// Handle leadflow.job.create; the job starts right away
pub async fn handle_create(
    client: Client,
    subscriber: Subscriber,
    supervisor: Arc<JobSupervisor>,
    upload_dir: PathBuf,
) -> Result<()> {
    serve_requests(client, subscriber, "create", move |request: CreateJobRequest| {
        let supervisor = supervisor.clone();
        let checked = check_file_source(&request, &upload_dir);
        async move {
            checked?;
            let job = supervisor.create(request).await?;
            Ok::<_, EngineError>(CreateJobResponse {
                job_id: job.id,
                status: job.status,
            })
        }
    })
    .await
}

/// Handle leadflow.job.pause
pub async fn handle_pause(
    client: Client,
    subscriber: Subscriber,
    supervisor: Arc<JobSupervisor>,
) -> Result<()> {
    serve_requests(client, subscriber, "pause", move |request: JobIdRequest| {
        let supervisor = supervisor.clone();
        async move {
            let accepted = supervisor.pause(request.job_id).await?;
            Ok::<_, EngineError>(JobControlResponse {
                job_id: request.job_id,
                accepted,
            })
        }
    })
    .await
}

/// Handle leadflow.job.resume; replies with the claimed job
pub async fn handle_resume(
    client: Client,
    subscriber: Subscriber,
    supervisor: Arc<JobSupervisor>,
) -> Result<()> {
    serve_requests(client, subscriber, "resume", move |request: JobIdRequest| {
        let supervisor = supervisor.clone();
        async move { supervisor.resume(request.job_id).await }
    })
    .await
}

/// Handle leadflow.job.cancel
pub async fn handle_cancel(
    client: Client,
    subscriber: Subscriber,
    supervisor: Arc<JobSupervisor>,
) -> Result<()> {
    serve_requests(client, subscriber, "cancel", move |request: JobIdRequest| {
        let supervisor = supervisor.clone();
        async move {
            let accepted = supervisor.cancel(request.job_id).await?;
            Ok::<_, EngineError>(JobControlResponse {
                job_id: request.job_id,
                accepted,
            })
        }
    })
    .await
}

/// Handle leadflow.job.get
pub async fn handle_get(
    client: Client,
    subscriber: Subscriber,
    supervisor: Arc<JobSupervisor>,
) -> Result<()> {
    serve_requests(client, subscriber, "get", move |request: JobIdRequest| {
        let supervisor = supervisor.clone();
        async move { supervisor.status(request.job_id).await }
    })
    .await
}

/// Handle leadflow.job.list
pub async fn handle_list(
    client: Client,
    subscriber: Subscriber,
    supervisor: Arc<JobSupervisor>,
) -> Result<()> {
    serve_requests(client, subscriber, "list", move |request: JobHistoryRequest| {
        let supervisor = supervisor.clone();
        async move {
            let jobs = supervisor.history(request.limit).await?;
            Ok::<_, EngineError>(JobHistoryResponse {
                total: jobs.len(),
                jobs,
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobKind, MappingSetRef, Request, TargetDescriptor};

    fn file_import(path: &Path) -> CreateJobRequest {
        CreateJobRequest {
            kind: JobKind::CsvImport,
            source: SourceLocator::File {
                path: path.to_string_lossy().into_owned(),
                delimiter: None,
            },
            target: TargetDescriptor::table("leads"),
            mapping_set: MappingSetRef::Name("bitrix-leads".into()),
            batch_size: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_create_refuses_files_outside_upload_dir() {
        let root = tempfile::tempdir().unwrap();
        let uploads = root.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();
        let uploaded = uploads.join("leads.csv");
        let operator_file = root.path().join("crm_master_export.csv");
        std::fs::write(&uploaded, b"ID\n1\n").unwrap();
        std::fs::write(&operator_file, b"ID\n1\n").unwrap();

        assert!(check_file_source(&file_import(&uploaded), &uploads).is_ok());
        let err = check_file_source(&file_import(&operator_file), &uploads).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_job_id_request_parses_from_envelope() {
        let json = r#"{
            "id": "7a0e7c2e-3a4b-4bb4-9a61-8f1d7f3c0a11",
            "timestamp": "2025-03-01T10:00:00Z",
            "payload": { "jobId": "1b4e28ba-2fa1-11d2-883f-0016d3cca427" }
        }"#;
        let request: Request<JobIdRequest> = serde_json::from_str(json).unwrap();
        assert_eq!(
            request.payload.job_id.to_string(),
            "1b4e28ba-2fa1-11d2-883f-0016d3cca427"
        );
    }

    #[test]
    fn test_history_request_limit_is_optional() {
        let json = r#"{
            "id": "7a0e7c2e-3a4b-4bb4-9a61-8f1d7f3c0a11",
            "timestamp": "2025-03-01T10:00:00Z",
            "payload": {}
        }"#;
        let request: Request<JobHistoryRequest> = serde_json::from_str(json).unwrap();
        assert!(request.payload.limit.is_none());
    }
}
