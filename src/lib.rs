pub mod config;
pub mod entities;
pub mod error;
pub mod routes;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

/// Installs the global `tracing` subscriber, honouring `RUST_LOG` when set.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("csv_blob_kit=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
