use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::entities::job;
use crate::entities::processing_file::Status;
use crate::services::file_store::{FileStore, StorageError};
use crate::services::repository::ProcessingFileRepository;
use crate::services::status_bus::StatusBus;
use crate::utils::csv_preview::{self, CsvCheckError, CsvSummary};

/// How often a running job re-reads its row to notice a cancel request.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("processing file {0} not found")]
    MissingFile(i32),

    #[error("no stored bytes for processing file {0}")]
    MissingBytes(i32),

    #[error("{0}")]
    InvalidCsv(String),

    #[error("task join error: {0}")]
    Join(String),
}

enum JobResult {
    Completed(CsvSummary),
    Canceled,
    /// Stopped by worker shutdown; the job stays 'processing' until recovered.
    Interrupted,
}

/// Processes queued jobs: checks each uploaded CSV end to end and settles
/// the file as `OK` or `ERROR`.
pub struct Worker {
    db: DatabaseConnection,
    repo: ProcessingFileRepository,
    store: Arc<dyn FileStore>,
    bus: StatusBus,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        db: DatabaseConnection,
        store: Arc<dyn FileStore>,
        bus: StatusBus,
        notify: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo: ProcessingFileRepository::new(db.clone()),
            db,
            store,
            bus,
            notify,
            poll_interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Worker started");

        // Jobs left 'processing' by a previous run never finished
        if let Err(e) = self.recover_stuck_jobs().await {
            tracing::error!("Failed to recover stuck jobs: {}", e);
        }

        while !shutdown.is_cancelled() {
            match self.process_next_job_until(&shutdown).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!("Worker error: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("Worker stopped");
    }

    pub async fn recover_stuck_jobs(&self) -> Result<u64, DbErr> {
        let result = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(job::STATUS_PENDING))
            .col_expr(job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(job::Column::Status.eq(job::STATUS_PROCESSING))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            tracing::info!("Recovered {} stuck jobs (reset to pending)", result.rows_affected);
        }

        Ok(result.rows_affected)
    }

    /// Claims and runs the oldest pending job. Returns `false` when the queue is empty.
    pub async fn process_next_job(&self) -> Result<bool, WorkerError> {
        self.process_next_job_until(&CancellationToken::new()).await
    }

    /// Like [`process_next_job`](Self::process_next_job), but a running check
    /// stops early once `shutdown` is cancelled.
    pub async fn process_next_job_until(&self, shutdown: &CancellationToken) -> Result<bool, WorkerError> {
        let job_opt = job::Entity::find()
            .filter(job::Column::Status.eq(job::STATUS_PENDING))
            .order_by_asc(job::Column::CreatedAt)
            .one(&self.db)
            .await?;

        let job_model = match job_opt {
            Some(j) => j,
            None => return Ok(false),
        };

        // Claim by compare-and-set so a concurrent worker or cancel wins cleanly
        let claimed = job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(job::STATUS_PROCESSING))
            .col_expr(job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(job::Column::Id.eq(job_model.id.as_str()))
            .filter(job::Column::Status.eq(job::STATUS_PENDING))
            .exec(&self.db)
            .await?;
        if claimed.rows_affected == 0 {
            return Ok(true);
        }

        tracing::info!("Worker picked up job {} for file {}", job_model.id, job_model.file_id);
        let job_start_time = Instant::now();

        match self.handle_job(&job_model, shutdown).await {
            Ok(JobResult::Completed(summary)) => {
                tracing::info!(
                    "Job {} completed successfully took {:.2?} | records={} columns={}",
                    job_model.id,
                    job_start_time.elapsed(),
                    summary.records,
                    summary.columns
                );
                self.finish_job(&job_model.id, job::STATUS_COMPLETED, None).await?;
                self.settle_file(job_model.file_id, Status::Ok).await?;
            }
            Ok(JobResult::Interrupted) => {
                tracing::info!(
                    "Job {} interrupted by shutdown after {:.2?}, left for recovery",
                    job_model.id,
                    job_start_time.elapsed()
                );
            }
            Ok(JobResult::Canceled) => {
                tracing::info!("Job {} canceled after {:.2?}", job_model.id, job_start_time.elapsed());
                self.finish_job(&job_model.id, job::STATUS_CANCELED, None).await?;
            }
            Err(e) => {
                tracing::warn!("Job {} failed: {}", job_model.id, e);
                self.finish_job(&job_model.id, job::STATUS_FAILED, Some(e.to_string()))
                    .await?;
                self.settle_file(job_model.file_id, Status::Error).await?;
            }
        }

        Ok(true)
    }

    async fn handle_job(
        &self,
        job: &job::Model,
        shutdown: &CancellationToken,
    ) -> Result<JobResult, WorkerError> {
        let file = self
            .repo
            .find(job.file_id)
            .await?
            .ok_or(WorkerError::MissingFile(job.file_id))?;

        if file.status != Status::Pending {
            return Ok(JobResult::Canceled);
        }

        let reader = self
            .store
            .open(file.id)
            .await?
            .ok_or(WorkerError::MissingBytes(file.id))?;

        let cancel = shutdown.child_token();
        let watcher = tokio::spawn(watch_for_cancel(
            self.db.clone(),
            job.id.clone(),
            cancel.clone(),
        ));

        let token = cancel.clone();
        let bridge = SyncIoBridge::new(reader);
        let checked = tokio::task::spawn_blocking(move || {
            csv_preview::check_csv(bridge, || token.is_cancelled())
        })
        .await;

        watcher.abort();

        match checked.map_err(|e| WorkerError::Join(e.to_string()))? {
            Err(CsvCheckError::Canceled) if shutdown.is_cancelled() => Ok(JobResult::Interrupted),
            Ok(summary) if cancel.is_cancelled() && !shutdown.is_cancelled() => {
                tracing::debug!("Job {} finished after cancel ({} records)", job.id, summary.records);
                Ok(JobResult::Canceled)
            }
            Ok(summary) => Ok(JobResult::Completed(summary)),
            Err(CsvCheckError::Canceled) => Ok(JobResult::Canceled),
            Err(e) => Err(WorkerError::InvalidCsv(e.to_string())),
        }
    }

    async fn finish_job(&self, job_id: &str, status: &str, error: Option<String>) -> Result<(), DbErr> {
        // only a job still marked 'processing' is updated, so a cancel that
        // landed mid-run is kept
        job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(status))
            .col_expr(job::Column::Error, Expr::value(error))
            .col_expr(job::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.eq(job::STATUS_PROCESSING))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn settle_file(&self, file_id: i32, status: Status) -> Result<(), DbErr> {
        if self.repo.transition(file_id, Status::Pending, status).await? {
            self.bus.publish(file_id);
        } else {
            tracing::debug!(file_id, "File already left PENDING, leaving it as is");
        }
        Ok(())
    }
}

async fn watch_for_cancel(db: DatabaseConnection, job_id: String, cancel: CancellationToken) {
    loop {
        sleep(CANCEL_POLL_INTERVAL).await;
        match job::Entity::find_by_id(job_id.clone()).one(&db).await {
            Ok(Some(job)) if job.status == job::STATUS_CANCELED => {
                cancel.cancel();
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => tracing::warn!("Failed to poll job {}: {}", job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dispatcher::QueueDispatcher;
    use crate::services::file_store::LocalFileStore;
    use crate::services::lifecycle::{LifecycleManager, SubmitOutcome};
    use crate::test_support::setup_db;
    use futures::stream;

    struct Setup {
        worker: Worker,
        manager: LifecycleManager,
        db: DatabaseConnection,
        _media: tempfile::TempDir,
    }

    async fn setup() -> Setup {
        let db = setup_db().await;
        let media = tempfile::tempdir().unwrap();
        let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(media.path()));
        let bus = StatusBus::new();
        let dispatcher = QueueDispatcher::new(db.clone());
        let worker = Worker::new(
            db.clone(),
            store.clone(),
            bus.clone(),
            dispatcher.job_notify(),
            Duration::from_millis(20),
        );
        let manager = LifecycleManager::new(
            ProcessingFileRepository::new(db.clone()),
            store,
            Arc::new(dispatcher),
            bus,
        );
        Setup {
            worker,
            manager,
            db,
            _media: media,
        }
    }

    async fn upload(manager: &LifecycleManager, data: &str) -> i32 {
        let body = stream::iter(vec![Ok::<_, std::io::Error>(data.as_bytes().to_vec())]);
        match manager.submit(body, Some("text/csv"), "data.csv").await.unwrap() {
            SubmitOutcome::Accepted { file, .. } => file.id,
            other => panic!("upload not accepted: {:?}", other),
        }
    }

    async fn job_for(db: &DatabaseConnection, file_id: i32) -> job::Model {
        job::Entity::find()
            .filter(job::Column::FileId.eq(file_id))
            .one(db)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_csv_settles_ok() {
        let s = setup().await;
        let file_id = upload(&s.manager, "id,name\n1,a\n2,b\n").await;
        let generation = s.manager.bus().current().generation;

        assert!(s.worker.process_next_job().await.unwrap());

        let file = s.manager.repository().find(file_id).await.unwrap().unwrap();
        assert_eq!(file.status, Status::Ok);
        assert!(file.job_id.is_none());
        assert_eq!(job_for(&s.db, file_id).await.status, job::STATUS_COMPLETED);
        assert!(s.manager.bus().current().generation > generation);

        assert!(!s.worker.process_next_job().await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_csv_settles_error() {
        let s = setup().await;
        let file_id = upload(&s.manager, "a,b\n1\n").await;

        s.worker.process_next_job().await.unwrap();

        let file = s.manager.repository().find(file_id).await.unwrap().unwrap();
        assert_eq!(file.status, Status::Error);
        let job = job_for(&s.db, file_id).await;
        assert_eq!(job.status, job::STATUS_FAILED);
        assert!(job.error.unwrap().contains("malformed CSV"));
    }

    #[tokio::test]
    async fn test_canceled_job_is_never_picked_up() {
        let s = setup().await;
        let file_id = upload(&s.manager, "a,b\n").await;
        s.manager.cancel_or_delete(file_id).await.unwrap();

        assert!(!s.worker.process_next_job().await.unwrap());

        let file = s.manager.repository().find(file_id).await.unwrap().unwrap();
        assert_eq!(file.status, Status::Canceled);
        assert_eq!(job_for(&s.db, file_id).await.status, job::STATUS_CANCELED);
    }

    #[tokio::test]
    async fn test_recover_stuck_jobs() {
        let s = setup().await;
        let file_id = upload(&s.manager, "a,b\n").await;
        job::Entity::update_many()
            .col_expr(job::Column::Status, Expr::value(job::STATUS_PROCESSING))
            .exec(&s.db)
            .await
            .unwrap();

        assert_eq!(s.worker.recover_stuck_jobs().await.unwrap(), 1);
        assert_eq!(job_for(&s.db, file_id).await.status, job::STATUS_PENDING);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_running_job_for_recovery() {
        let s = setup().await;
        let file_id = upload(&s.manager, "a,b\n1,2\n3,4\n").await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(s.worker.process_next_job_until(&shutdown).await.unwrap());

        let file = s.manager.repository().find(file_id).await.unwrap().unwrap();
        assert_eq!(file.status, Status::Pending);
        assert_eq!(job_for(&s.db, file_id).await.status, job::STATUS_PROCESSING);

        assert_eq!(s.worker.recover_stuck_jobs().await.unwrap(), 1);
        assert!(s.worker.process_next_job().await.unwrap());
        let file = s.manager.repository().find(file_id).await.unwrap().unwrap();
        assert_eq!(file.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_run_processes_until_shutdown() {
        let s = setup().await;
        let worker = Arc::new(s.worker);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        let mut updates = Box::pin(s.manager.listing_updates());
        use futures::StreamExt;
        updates.next().await.unwrap();

        let file_id = upload(&s.manager, "a,b\n1,2\n").await;

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let files = updates.next().await.unwrap();
                if files.iter().any(|f| f.id == file_id && f.status == Status::Ok) {
                    break;
                }
            }
        })
        .await;
        assert!(settled.is_ok(), "worker never settled the file");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
