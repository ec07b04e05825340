//! Adapter to the worker pool that processes uploaded files.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::entities::job;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("job queue unavailable: {0}")]
    Unavailable(String),
}

/// Opaque reference to a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Submits processing for `file_id`. One attempt, no retry.
    async fn dispatch(&self, file_id: i32) -> Result<JobHandle, DispatchError>;

    /// Asks the pool to stop the job. Advisory: the job may already be past
    /// the point where it can stop, and failures are only logged.
    async fn cancel(&self, handle: &JobHandle);
}

/// Dispatches by enqueueing a row in the `jobs` table for [`Worker`](super::worker::Worker).
#[derive(Clone)]
pub struct QueueDispatcher {
    db: DatabaseConnection,
    notify: Arc<Notify>,
}

impl QueueDispatcher {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Handle the worker waits on between polls.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[async_trait]
impl JobDispatcher for QueueDispatcher {
    async fn dispatch(&self, file_id: i32) -> Result<JobHandle, DispatchError> {
        let now = Utc::now();
        let job = job::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            file_id: Set(file_id),
            status: Set(job::STATUS_PENDING.to_string()),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let job = job
            .insert(&self.db)
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        self.notify.notify_one();
        tracing::info!(file_id, job_id = %job.id, "Job queued");
        Ok(JobHandle(job.id))
    }

    async fn cancel(&self, handle: &JobHandle) {
        let result = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(job::STATUS_CANCELED))
            .col_expr(job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(job::Column::Id.eq(handle.as_str()))
            .filter(job::Column::Status.is_in([job::STATUS_PENDING, job::STATUS_PROCESSING]))
            .exec(&self.db)
            .await;

        match result {
            Ok(res) if res.rows_affected > 0 => tracing::info!(job_id = %handle, "Job cancel requested"),
            Ok(_) => tracing::debug!(job_id = %handle, "Job already finished, nothing to cancel"),
            Err(e) => tracing::warn!(job_id = %handle, "Failed to cancel job: {}", e),
        }
    }
}
