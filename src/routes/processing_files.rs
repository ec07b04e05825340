use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, State},
    response::{
        sse::{Event, KeepAlive},
        Json, Sse,
    },
};
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::entities::processing_file;
use crate::error::AppError;
use crate::routes::AppState;
use crate::services::lifecycle::{CancelOutcome, FileDetail, LifecycleError, SubmitOutcome};

/// Name of the server-sent event pushed on every status change.
pub const STATUS_EVENT: &str = "handlingStatusChanged";

#[derive(Serialize, utoipa::ToSchema)]
pub struct UploadView {
    pub accepted: bool,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<processing_file::Model>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl UploadView {
    fn accepted(file: processing_file::Model) -> Self {
        Self {
            accepted: true,
            filename: file.filename.clone(),
            file: Some(file),
            reason: None,
        }
    }

    fn dismissed(filename: String, file: Option<processing_file::Model>, reason: String) -> Self {
        Self {
            accepted: false,
            filename,
            file,
            reason: Some(reason),
        }
    }
}

#[derive(Serialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CancelAction {
    Removed,
    Canceled,
    Unchanged,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct CancelView {
    pub action: CancelAction,
    pub file: processing_file::Model,
}

impl From<CancelOutcome> for CancelView {
    fn from(outcome: CancelOutcome) -> Self {
        match outcome {
            CancelOutcome::Removed(file) => Self {
                action: CancelAction::Removed,
                file,
            },
            CancelOutcome::Canceled(file) => Self {
                action: CancelAction::Canceled,
                file,
            },
            CancelOutcome::Unchanged(file) => Self {
                action: CancelAction::Unchanged,
                file,
            },
        }
    }
}

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "All processing files, newest first", body = Vec<processing_file::Model>),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Processing Files"
)]
pub async fn list_processing_files(
    State(state): State<AppState>,
) -> Result<Json<Vec<processing_file::Model>>, AppError> {
    Ok(Json(state.files.list().await?))
}

#[utoipa::path(
    post,
    path = "/",
    tag = "Processing Files",
    request_body(content = Vec<u8>, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Upload accepted, or dismissed with a reason", body = UploadView),
        (status = 400, description = "Bad Request"),
        (status = 500, description = "Internal Server Error")
    )
)]
pub async fn create_processing_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadView>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| AppError::BadRequest("Invalid multipart data".to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("unknown").to_string();
        let content_type = field.content_type().map(str::to_string);

        return match state.files.submit(field, content_type.as_deref(), &filename).await {
            Ok(SubmitOutcome::Accepted { file, job }) => {
                tracing::info!("Files | POST / | file={} | job={} | res=200", file.id, job);
                Ok(Json(UploadView::accepted(file)))
            }
            Ok(SubmitOutcome::Failed { file }) => {
                tracing::info!("Files | POST / | file={} | res=200 | upload not stored", file.id);
                Ok(Json(UploadView::dismissed(
                    filename,
                    Some(file),
                    "The file could not be stored".to_string(),
                )))
            }
            Err(LifecycleError::Validation(reason)) => {
                tracing::info!("Files | POST / | filename={} | res=200 | {}", filename, reason);
                Ok(Json(UploadView::dismissed(filename, None, reason)))
            }
            Err(e) => Err(e.into()),
        };
    }

    tracing::info!("Files | POST / | res=400 | No file field found");
    Err(AppError::BadRequest("No file field found".to_string()))
}

#[utoipa::path(
    get,
    path = "/{file_id}/detail/",
    params(
        ("file_id" = i32, Path, description = "Processing file ID")
    ),
    responses(
        (status = 200, description = "File record and up to 10 leading rows", body = FileDetail),
        (status = 404, description = "File not found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Processing Files"
)]
pub async fn get_processing_file_detail(
    State(state): State<AppState>,
    Path(file_id): Path<i32>,
) -> Result<Json<FileDetail>, AppError> {
    Ok(Json(state.files.detail(file_id).await?))
}

#[utoipa::path(
    delete,
    path = "/{file_id}/",
    params(
        ("file_id" = i32, Path, description = "Processing file ID")
    ),
    responses(
        (status = 200, description = "Processing canceled, or processed file removed", body = CancelView),
        (status = 404, description = "File not found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Processing Files"
)]
pub async fn cancel_or_delete_processing_file(
    State(state): State<AppState>,
    Path(file_id): Path<i32>,
) -> Result<Json<CancelView>, AppError> {
    let outcome = state.files.cancel_or_delete(file_id).await.inspect_err(|e| {
        if matches!(e, LifecycleError::NotFound(_)) {
            tracing::info!("Files | DELETE /{}/ | res=404", file_id);
        }
    })?;
    let view = CancelView::from(outcome);
    tracing::info!(
        "Files | DELETE /{}/ | status={} | res=200",
        file_id,
        view.file.status
    );
    Ok(Json(view))
}

#[utoipa::path(
    get,
    path = "/listen-updates/",
    responses(
        (status = 200, description = "Server-sent `handlingStatusChanged` events carrying the full listing", body = String, content_type = "text/event-stream")
    ),
    tag = "Processing Files"
)]
pub async fn listen_handling_status(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!("Files | GET /listen-updates/ | watcher connected");

    let stream = state
        .files
        .listing_updates()
        .take_until(state.shutdown.clone().cancelled_owned())
        .filter_map(|files| async move {
            match listing_payload(&files) {
                Ok(payload) => Some(Ok(Event::default().event(STATUS_EVENT).data(payload))),
                Err(e) => {
                    tracing::error!("Failed to serialize listing: {}", e);
                    None
                }
            }
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Compact JSON listing with line breaks removed, since the event stream
/// frames on newlines.
pub fn listing_payload(files: &[processing_file::Model]) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(files)?;
    Ok(json.replace(['\n', '\r'], ""))
}
