//! Orchestrates the processing file state machine.
//!
//! ```text
//!   PENDING ──worker──▶ OK ──delete──▶ REMOVED
//!      │  └──worker──▶ ERROR
//!      └────cancel───▶ CANCELED
//! ```
//!
//! Every status change goes through a compare-and-set in the repository, and
//! every change is announced on the [`StatusBus`].

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;

use crate::config::DEFAULT_UPLOAD_CHUNK_SIZE;
use crate::entities::processing_file::{self, Status};
use crate::services::dispatcher::{DispatchError, JobDispatcher, JobHandle};
use crate::services::file_store::{FileStore, StorageError};
use crate::services::repository::ProcessingFileRepository;
use crate::services::status_bus::StatusBus;
use crate::utils::csv_preview::{self, PREVIEW_ROWS};

pub const CSV_CONTENT_TYPE: &str = "text/csv";

const LISTING_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),

    #[error("processing file {0} not found")]
    NotFound(i32),

    #[error("job dispatch failed for file {file_id}: {source}")]
    Dispatch {
        file_id: i32,
        #[source]
        source: DispatchError,
    },

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// How a submit ended once the upload passed validation.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Bytes stored and a job dispatched.
    Accepted {
        file: processing_file::Model,
        job: JobHandle,
    },
    /// Writing the bytes failed; the record is now `ERROR`.
    Failed { file: processing_file::Model },
}

/// What cancel-or-delete did to a record.
#[derive(Debug)]
pub enum CancelOutcome {
    /// `OK -> REMOVED`, stored bytes deleted.
    Removed(processing_file::Model),
    /// `PENDING -> CANCELED`, stored bytes kept.
    Canceled(processing_file::Model),
    /// The record was already terminal, or another request transitioned it first.
    Unchanged(processing_file::Model),
}

impl CancelOutcome {
    pub fn file(&self) -> &processing_file::Model {
        match self {
            CancelOutcome::Removed(file)
            | CancelOutcome::Canceled(file)
            | CancelOutcome::Unchanged(file) => file,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct FileDetail {
    pub file: processing_file::Model,
    /// Leading rows of the stored CSV, absent when no bytes are stored.
    pub data: Option<Vec<Vec<String>>>,
}

/// The branch cancel-or-delete takes for a given current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Remove,
    Cancel,
    Settled,
}

impl From<Status> for Disposition {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => Disposition::Remove,
            Status::Pending => Disposition::Cancel,
            Status::Error | Status::Canceled | Status::Removed => Disposition::Settled,
        }
    }
}

#[derive(Error, Debug)]
enum UploadFailure {
    #[error("upload stream failed: {0}")]
    Stream(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub fn is_csv_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|essence| essence.trim().eq_ignore_ascii_case(CSV_CONTENT_TYPE))
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct LifecycleManager {
    repo: ProcessingFileRepository,
    store: Arc<dyn FileStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    bus: StatusBus,
    chunk_size: usize,
}

impl LifecycleManager {
    pub fn new(
        repo: ProcessingFileRepository,
        store: Arc<dyn FileStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        bus: StatusBus,
    ) -> Self {
        Self {
            repo,
            store,
            dispatcher,
            bus,
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn bus(&self) -> &StatusBus {
        &self.bus
    }

    pub fn repository(&self) -> &ProcessingFileRepository {
        &self.repo
    }

    /// Accepts an uploaded CSV: record first, then bytes, then the job.
    ///
    /// Non-CSV input fails with [`LifecycleError::Validation`] before anything
    /// is created. A failed byte write is not an error for the caller: the
    /// record is parked in `ERROR` and [`SubmitOutcome::Failed`] is returned.
    /// A dispatch failure is returned as an error and leaves the record
    /// `PENDING` with no job id.
    pub async fn submit<S, B, E>(
        &self,
        upload: S,
        content_type: Option<&str>,
        filename: &str,
    ) -> Result<SubmitOutcome, LifecycleError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        if !is_csv_content_type(content_type) {
            return Err(LifecycleError::Validation(format!(
                "unsupported content type: {}",
                content_type.unwrap_or("none")
            )));
        }

        let file = self.repo.create(filename).await?;
        let file_id = file.id;
        self.bus.publish(file_id);

        match self.write_bytes(file_id, upload).await {
            Ok(written) => {
                tracing::debug!(file_id, bytes = written, "Upload stored");
            }
            Err(e) => {
                tracing::warn!(file_id, "Upload failed, marking file as ERROR: {}", e);
                self.repo.transition(file_id, Status::Pending, Status::Error).await?;
                self.bus.publish(file_id);
                let file = self.reload(file_id).await?;
                return Ok(SubmitOutcome::Failed { file });
            }
        }

        let job = self
            .dispatcher
            .dispatch(file_id)
            .await
            .map_err(|source| LifecycleError::Dispatch { file_id, source })?;

        if !self.repo.attach_job(file_id, job.as_str()).await? {
            // canceled while the job was being dispatched
            tracing::info!(file_id, job_id = %job, "File left PENDING during dispatch, canceling job");
            self.dispatcher.cancel(&job).await;
        }

        let file = self.reload(file_id).await?;
        Ok(SubmitOutcome::Accepted { file, job })
    }

    /// Streams the upload into the store. The sink is finished or aborted
    /// before this returns, so nothing is held open across dispatch.
    async fn write_bytes<S, B, E>(&self, file_id: i32, upload: S) -> Result<u64, UploadFailure>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let mut upload = std::pin::pin!(upload);
        let mut sink = self.store.create(file_id).await?;
        let mut written = 0u64;

        while let Some(next) = upload.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(e) => {
                    sink.abort().await;
                    return Err(UploadFailure::Stream(e.to_string()));
                }
            };

            for chunk in bytes.as_ref().chunks(self.chunk_size) {
                if let Err(e) = sink.write_chunk(chunk).await {
                    sink.abort().await;
                    return Err(e.into());
                }
                written += chunk.len() as u64;
            }
        }

        if let Err(e) = sink.finish().await {
            if let Err(cleanup) = self.store.delete(file_id).await {
                tracing::warn!(file_id, "Failed to discard unfinished upload: {}", cleanup);
            }
            return Err(e.into());
        }

        Ok(written)
    }

    /// Cancels in-flight work or removes a processed file, depending on the
    /// record's current status.
    pub async fn cancel_or_delete(&self, id: i32) -> Result<CancelOutcome, LifecycleError> {
        loop {
            let file = self.repo.find(id).await?.ok_or(LifecycleError::NotFound(id))?;

            let target = match Disposition::from(file.status) {
                Disposition::Remove => Status::Removed,
                Disposition::Cancel => Status::Canceled,
                Disposition::Settled => return Ok(CancelOutcome::Unchanged(file)),
            };

            // Loses when the status moved or a job was attached since the
            // read above. Either way the row changed, so read it again.
            if !self.repo.transition_seen(&file, target).await? {
                continue;
            }

            self.cancel_job(&file).await;

            let outcome = if target == Status::Removed {
                if let Err(e) = self.store.delete(id).await {
                    tracing::warn!(file_id = id, "Failed to delete stored bytes: {}", e);
                }
                CancelOutcome::Removed(self.reload(id).await?)
            } else {
                CancelOutcome::Canceled(self.reload(id).await?)
            };

            self.bus.publish(id);
            return Ok(outcome);
        }
    }

    async fn cancel_job(&self, file: &processing_file::Model) {
        if let Some(job_id) = &file.job_id {
            self.dispatcher.cancel(&JobHandle(job_id.clone())).await;
        }
    }

    /// The record plus up to ten leading rows of its stored CSV.
    pub async fn detail(&self, id: i32) -> Result<FileDetail, LifecycleError> {
        let file = self.repo.find(id).await?.ok_or(LifecycleError::NotFound(id))?;

        let data = match self.store.open(id).await {
            Ok(Some(reader)) => match csv_preview::read_preview(reader, PREVIEW_ROWS).await {
                Ok(rows) => Some(rows),
                Err(e) => {
                    tracing::warn!(file_id = id, "Failed to read preview rows: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(file_id = id, "Failed to open stored file: {}", e);
                None
            }
        };

        Ok(FileDetail { file, data })
    }

    pub async fn list(&self) -> Result<Vec<processing_file::Model>, LifecycleError> {
        Ok(self.repo.list().await?)
    }

    /// The full listing now, then again after every status change.
    ///
    /// Changes that land while a listing is being read or consumed fold into
    /// the next item. A failed read is retried rather than ending the stream.
    /// Dropping the stream releases the subscription.
    pub fn listing_updates(&self) -> impl Stream<Item = Vec<processing_file::Model>> + Send + 'static {
        let repo = self.repo.clone();
        let subscription = self.bus.subscribe();

        futures::stream::unfold(
            (repo, subscription, true),
            |(repo, mut subscription, first)| async move {
                if !first {
                    subscription.changed().await?;
                }
                loop {
                    subscription.mark_seen();
                    match repo.list().await {
                        Ok(files) => return Some((files, (repo, subscription, false))),
                        Err(e) => {
                            tracing::warn!("Listing read failed, retrying: {}", e);
                            tokio::time::sleep(LISTING_RETRY_DELAY).await;
                        }
                    }
                }
            },
        )
    }

    async fn reload(&self, id: i32) -> Result<processing_file::Model, LifecycleError> {
        self.repo.find(id).await?.ok_or(LifecycleError::NotFound(id))
    }
}
