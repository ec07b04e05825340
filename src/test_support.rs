use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use crate::services::dispatcher::{DispatchError, JobDispatcher, JobHandle};
use crate::services::file_store::{
    FileSink, FileStore, LocalFileStore, StorageError, StoredReader,
};
use crate::services::lifecycle::LifecycleManager;
use crate::services::repository::ProcessingFileRepository;
use crate::services::status_bus::StatusBus;

/// Fresh in-memory SQLite database with all migrations applied.
pub async fn setup_db() -> DatabaseConnection {
    // one connection: every new in-memory connection is a separate database
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db
}

/// In-process stand-in for the worker pool.
#[derive(Default)]
pub struct FakeDispatcher {
    pub dispatched: Mutex<Vec<i32>>,
    pub canceled: Mutex<Vec<JobHandle>>,
    pub fail: AtomicBool,
}

impl FakeDispatcher {
    pub fn dispatched(&self) -> Vec<i32> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> Vec<JobHandle> {
        self.canceled.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobDispatcher for FakeDispatcher {
    async fn dispatch(&self, file_id: i32) -> Result<JobHandle, DispatchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Unavailable("queue down".to_string()));
        }
        self.dispatched.lock().unwrap().push(file_id);
        Ok(JobHandle(format!("job-{}", file_id)))
    }

    async fn cancel(&self, handle: &JobHandle) {
        self.canceled.lock().unwrap().push(handle.clone());
    }
}

pub struct Harness {
    pub manager: LifecycleManager,
    pub dispatcher: Arc<FakeDispatcher>,
    pub store: LocalFileStore,
    pub db: DatabaseConnection,
    _media: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    let db = setup_db().await;
    let media = tempfile::tempdir().unwrap();
    let store = LocalFileStore::new(media.path());
    let dispatcher = Arc::new(FakeDispatcher::default());
    let manager = LifecycleManager::new(
        ProcessingFileRepository::new(db.clone()),
        Arc::new(store.clone()),
        dispatcher.clone(),
        StatusBus::new(),
    );

    Harness {
        manager,
        dispatcher,
        store,
        db,
        _media: media,
    }
}

/// Where [`FailingStore`] makes a write go wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailAt {
    WriteChunk,
    Finish,
}

/// Local store whose writes fail at a chosen step. A failed `finish` still
/// leaves the bytes on disk, like a backend that lost the commit reply.
#[derive(Clone)]
pub struct FailingStore {
    pub inner: LocalFileStore,
    pub fail_at: FailAt,
}

struct FailingSink {
    inner: Box<dyn FileSink>,
    fail_at: FailAt,
}

fn injected(step: &str) -> StorageError {
    StorageError::Remote {
        key: "test".to_string(),
        message: format!("injected {} failure", step),
    }
}

#[async_trait]
impl FileSink for FailingSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        if self.fail_at == FailAt::WriteChunk {
            return Err(injected("write"));
        }
        self.inner.write_chunk(chunk).await
    }

    async fn finish(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.finish().await?;
        match self.fail_at {
            FailAt::Finish => Err(injected("finish")),
            FailAt::WriteChunk => Ok(()),
        }
    }

    async fn abort(self: Box<Self>) {
        self.inner.abort().await;
    }
}

#[async_trait]
impl FileStore for FailingStore {
    async fn create(&self, file_id: i32) -> Result<Box<dyn FileSink>, StorageError> {
        Ok(Box::new(FailingSink {
            inner: self.inner.create(file_id).await?,
            fail_at: self.fail_at,
        }))
    }

    async fn open(&self, file_id: i32) -> Result<Option<StoredReader>, StorageError> {
        self.inner.open(file_id).await
    }

    async fn delete(&self, file_id: i32) -> Result<(), StorageError> {
        self.inner.delete(file_id).await
    }
}

/// Harness whose store fails at `fail_at`.
pub async fn failing_harness(fail_at: FailAt) -> Harness {
    let db = setup_db().await;
    let media = tempfile::tempdir().unwrap();
    let store = LocalFileStore::new(media.path());
    let dispatcher = Arc::new(FakeDispatcher::default());
    let manager = LifecycleManager::new(
        ProcessingFileRepository::new(db.clone()),
        Arc::new(FailingStore {
            inner: store.clone(),
            fail_at,
        }),
        dispatcher.clone(),
        StatusBus::new(),
    );

    Harness {
        manager,
        dispatcher,
        store,
        db,
        _media: media,
    }
}
