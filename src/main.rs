use std::sync::Arc;

use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use tokio_util::sync::CancellationToken;

use csv_blob_kit::config::{Config, StorageBackend};
use csv_blob_kit::routes::{create_routes, AppState};
use csv_blob_kit::services::dispatcher::QueueDispatcher;
use csv_blob_kit::services::file_store::{FileStore, LocalFileStore};
use csv_blob_kit::services::lifecycle::LifecycleManager;
use csv_blob_kit::services::repository::ProcessingFileRepository;
use csv_blob_kit::services::s3::S3FileStore;
use csv_blob_kit::services::status_bus::StatusBus;
use csv_blob_kit::services::worker::Worker;

#[derive(Parser)]
#[command(name = "csv-blob-kit", version, about = "CSV upload and processing service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run migrations, the background worker and the HTTP server (default)
    Serve,
    /// Apply pending migrations and exit
    Migrate,
    /// Drop every table created by the migrations
    ResetDb,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    csv_blob_kit::init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let db = Database::connect(config.database_url.as_str()).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, db).await?,
        Command::Migrate => {
            Migrator::up(&db, None).await?;
            tracing::info!("Migrations applied");
        }
        Command::ResetDb => reset_db(&db).await?,
    }

    Ok(())
}

async fn serve(config: Config, db: DatabaseConnection) -> Result<(), Box<dyn std::error::Error>> {
    Migrator::up(&db, None).await?;

    let store: Arc<dyn FileStore> = match &config.storage {
        StorageBackend::Local { media_root } => {
            tokio::fs::create_dir_all(media_root).await?;
            tracing::info!("Storing uploads under {}", media_root.display());
            Arc::new(LocalFileStore::new(media_root.clone()))
        }
        StorageBackend::S3(settings) => {
            let store = S3FileStore::new(settings).await;
            store.ensure_bucket_exists().await?;
            tracing::info!("Storing uploads in bucket {}", settings.bucket_name);
            Arc::new(store)
        }
    };

    let bus = StatusBus::new();
    let dispatcher = QueueDispatcher::new(db.clone());
    let shutdown = CancellationToken::new();

    let worker_task = if config.worker_enabled {
        let worker = Worker::new(
            db.clone(),
            store.clone(),
            bus.clone(),
            dispatcher.job_notify(),
            config.worker_poll_interval,
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(token).await }))
    } else {
        tracing::warn!("Worker disabled, uploaded files will stay PENDING");
        None
    };

    let manager = LifecycleManager::new(
        ProcessingFileRepository::new(db.clone()),
        store,
        Arc::new(dispatcher),
        bus,
    )
    .with_chunk_size(config.upload_chunk_size);

    let app = create_routes(AppState::new(manager).with_shutdown(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = worker_task {
        if let Err(e) = task.await {
            tracing::error!("Worker task failed: {}", e);
        }
    }

    Ok(())
}

async fn reset_db(db: &DatabaseConnection) -> Result<(), Box<dyn std::error::Error>> {
    Migrator::reset(db).await?;

    let backend = db.get_database_backend();
    db.execute(Statement::from_string(
        backend,
        "DROP TABLE IF EXISTS seaql_migrations".to_owned(),
    ))
    .await?;

    tracing::info!("Database reset successfully");
    Ok(())
}
