#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, Response},
    Router,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value;

use csv_blob_kit::routes::{create_routes, AppState};
use csv_blob_kit::services::dispatcher::{DispatchError, JobDispatcher, JobHandle};
use csv_blob_kit::services::file_store::{FileStore, LocalFileStore};
use csv_blob_kit::services::lifecycle::LifecycleManager;
use csv_blob_kit::services::repository::ProcessingFileRepository;
use csv_blob_kit::services::status_bus::StatusBus;

pub const BOUNDARY: &str = "csv-blob-kit-test-boundary";

pub async fn setup_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    db
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub canceled: Mutex<Vec<JobHandle>>,
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, file_id: i32) -> Result<JobHandle, DispatchError> {
        Ok(JobHandle(format!("job-{}", file_id)))
    }

    async fn cancel(&self, handle: &JobHandle) {
        self.canceled.lock().unwrap().push(handle.clone());
    }
}

pub struct TestApp {
    pub router: Router,
    pub manager: LifecycleManager,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub store: Arc<dyn FileStore>,
    pub db: DatabaseConnection,
    _media: tempfile::TempDir,
}

pub async fn test_app() -> TestApp {
    let db = setup_db().await;
    let media = tempfile::tempdir().unwrap();
    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(media.path()));
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let manager = LifecycleManager::new(
        ProcessingFileRepository::new(db.clone()),
        store.clone(),
        dispatcher.clone(),
        StatusBus::new(),
    );
    let router = create_routes(AppState::new(manager.clone()));

    TestApp {
        router,
        manager,
        dispatcher,
        store,
        db,
        _media: media,
    }
}

/// A multipart/form-data request with a single part.
pub fn upload_request(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
