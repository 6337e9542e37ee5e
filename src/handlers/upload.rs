//! Upload handler: stores base64 source files for csv_import jobs

use std::path::PathBuf;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use tracing::{error, info};
use uuid::Uuid;

use crate::services::uploads::store_upload;
use crate::types::{ErrorResponse, Request, SuccessResponse, UploadRequest};

/// Handle leadflow.upload requests
pub async fn handle_upload(
    client: Client,
    mut subscriber: Subscriber,
    upload_dir: PathBuf,
    max_upload_bytes: u64,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<UploadRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse upload request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let payload = request.payload;
        match store_upload(&upload_dir, &payload.filename, &payload.content_base64, max_upload_bytes).await {
            Ok(response) => {
                info!("Upload {} stored at {}", payload.filename, response.path);
                let success = SuccessResponse::new(request.id, response);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                error!("Failed to store upload {}: {:#}", payload.filename, e);
                let error = ErrorResponse::new(request.id, "UPLOAD_FAILED", format!("{:#}", e));
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}
