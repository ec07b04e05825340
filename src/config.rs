use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_MEDIA_ROOT: &str = "./media";
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;
const DEFAULT_WORKER_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Local { media_root: PathBuf },
    S3(S3Settings),
}

#[derive(Debug, Clone, PartialEq)]
pub struct S3Settings {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub storage: StorageBackend,
    pub upload_chunk_size: usize,
    pub worker_poll_interval: Duration,
    pub worker_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind_addr = parse_or("BIND_ADDR", &lookup, DEFAULT_BIND_ADDR.parse().ok())?;

        let storage = match lookup("STORAGE_BACKEND").as_deref().unwrap_or("local") {
            "local" => StorageBackend::Local {
                media_root: lookup("MEDIA_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT)),
            },
            "s3" => StorageBackend::S3(S3Settings {
                bucket_name: lookup("S3_BUCKET_NAME").ok_or(ConfigError::Missing("S3_BUCKET_NAME"))?,
                region: lookup("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id: lookup("AWS_ACCESS_KEY_ID"),
                secret_access_key: lookup("AWS_SECRET_ACCESS_KEY"),
                endpoint: lookup("S3_ENDPOINT"),
            }),
            other => {
                return Err(ConfigError::Invalid {
                    name: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let upload_chunk_size: usize =
            parse_or("UPLOAD_CHUNK_SIZE", &lookup, Some(DEFAULT_UPLOAD_CHUNK_SIZE))?;
        if upload_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "UPLOAD_CHUNK_SIZE",
                value: "0".to_string(),
            });
        }

        let poll_secs: u64 = parse_or(
            "WORKER_POLL_INTERVAL_SECS",
            &lookup,
            Some(DEFAULT_WORKER_POLL_INTERVAL_SECS),
        )?;
        let worker_enabled: bool = parse_or("WORKER_ENABLED", &lookup, Some(true))?;

        Ok(Self {
            database_url,
            bind_addr,
            storage,
            upload_chunk_size,
            worker_poll_interval: Duration::from_secs(poll_secs),
            worker_enabled,
        })
    }
}

fn parse_or<T, F>(name: &'static str, lookup: &F, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => default.ok_or(ConfigError::Missing(name)),
    }
}
