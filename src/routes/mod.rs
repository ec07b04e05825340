pub mod processing_files;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::services::lifecycle::LifecycleManager;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub files: LifecycleManager,
    /// Cancelled on shutdown so open event streams end and the server can drain.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(files: LifecycleManager) -> Self {
        Self {
            files,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

// Define the OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        processing_files::list_processing_files,
        processing_files::create_processing_file,
        processing_files::get_processing_file_detail,
        processing_files::cancel_or_delete_processing_file,
        processing_files::listen_handling_status,
    ),
    components(
        schemas(
            crate::entities::processing_file::Model,
            crate::entities::processing_file::Status,
            crate::services::lifecycle::FileDetail,
            processing_files::UploadView,
            processing_files::CancelView,
            processing_files::CancelAction,
        )
    ),
    tags(
        (name = "Processing Files", description = "CSV upload, cancellation, preview and status updates")
    ),
    info(
        title = "CsvBlobKit API",
        version = "0.1.0",
        description = "A Rust/Axum service that stores uploaded CSV files and tracks their background processing",
    )
)]
struct ApiDoc;

pub fn create_routes(state: AppState) -> Router {
    // Swagger UI (stateless)
    let swagger_router: Router = SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDoc::openapi())
        .into();

    let app_routes = Router::new()
        .route(
            "/",
            get(processing_files::list_processing_files)
                .post(processing_files::create_processing_file),
        )
        .route(
            "/listen-updates/",
            get(processing_files::listen_handling_status),
        )
        .route(
            "/{file_id}/",
            delete(processing_files::cancel_or_delete_processing_file),
        )
        .route(
            "/{file_id}/detail/",
            get(processing_files::get_processing_file_detail),
        )
        // uploads are streamed to storage, so no request body cap
        .layer(DefaultBodyLimit::disable())
        .with_state(state);

    Router::new()
        .merge(swagger_router)
        .merge(app_routes)
        .layer(TraceLayer::new_for_http())
}
