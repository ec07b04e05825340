use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;

use crate::config::S3Settings;
use crate::entities::processing_file::storage_key;
use crate::services::file_store::{FileSink, FileStore, StorageError, StoredReader};

/// S3 rejects multipart parts smaller than this, except the last one.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct S3FileStore {
    client: Client,
    pub bucket_name: String,
}

fn remote_error(key: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Remote {
        key: key.to_string(),
        message: err.to_string(),
    }
}

impl S3FileStore {
    pub async fn new(settings: &S3Settings) -> Self {
        let region = aws_sdk_s3::config::Region::new(settings.region.clone());

        let mut s3_config_builder = match (&settings.access_key_id, &settings.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    access_key_id.clone(),
                    secret_access_key.clone(),
                    None,
                    None,
                    "manual_config",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
            }
            _ => {
                // fall back to the environment / profile / instance credential chain
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint) = &settings.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Self {
            client,
            bucket_name: settings.bucket_name.clone(),
        }
    }

    pub async fn ensure_bucket_exists(&self) -> Result<(), StorageError> {
        let resp = self.client.head_bucket().bucket(&self.bucket_name).send().await;

        if resp.is_ok() {
            return Ok(());
        }

        tracing::info!("Bucket {} does not exist, attempting to create...", self.bucket_name);
        self.client
            .create_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to create bucket: {:?}", e);
                remote_error(&self.bucket_name, e)
            })?;

        Ok(())
    }
}

#[async_trait]
impl FileStore for S3FileStore {
    async fn create(&self, file_id: i32) -> Result<Box<dyn FileSink>, StorageError> {
        Ok(Box::new(S3FileSink {
            client: self.client.clone(),
            bucket_name: self.bucket_name.clone(),
            key: storage_key(file_id),
            buffer: Vec::new(),
            upload: None,
        }))
    }

    async fn open(&self, file_id: i32) -> Result<Option<StoredReader>, StorageError> {
        let key = storage_key(file_id);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .send()
            .await;

        match resp {
            Ok(output) => Ok(Some(Box::new(Box::pin(output.body.into_async_read())))),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            Err(e) => {
                tracing::error!("S3 Download Error: {:?}", e);
                Err(remote_error(&key, e))
            }
        }
    }

    async fn delete(&self, file_id: i32) -> Result<(), StorageError> {
        // S3 deletes succeed for keys that do not exist
        let key = storage_key(file_id);
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("S3 Delete Error: {}", e);
                remote_error(&key, e)
            })?;

        Ok(())
    }
}

struct MultipartState {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

/// Buffers writes up to one part. Small files go out as a single
/// `PutObject`; anything bigger becomes a multipart upload.
struct S3FileSink {
    client: Client,
    bucket_name: String,
    key: String,
    buffer: Vec<u8>,
    upload: Option<MultipartState>,
}

impl S3FileSink {
    async fn flush_part(&mut self) -> Result<(), StorageError> {
        if self.upload.is_none() {
            let created = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket_name)
                .key(&self.key)
                .content_type("text/csv")
                .send()
                .await
                .map_err(|e| remote_error(&self.key, e))?;
            let upload_id = created
                .upload_id()
                .ok_or_else(|| remote_error(&self.key, "missing multipart upload id"))?
                .to_string();
            self.upload = Some(MultipartState {
                upload_id,
                parts: Vec::new(),
            });
        }

        let Some(upload) = self.upload.as_mut() else {
            return Ok(());
        };
        let part_number = upload.parts.len() as i32 + 1;
        let body = std::mem::take(&mut self.buffer);

        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket_name)
            .key(&self.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| remote_error(&self.key, e))?;

        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete_multipart(&mut self) -> Result<(), StorageError> {
        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }

        let Some(upload) = self.upload.as_ref() else {
            return Ok(());
        };
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket_name)
            .key(&self.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(upload.parts.clone()))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                tracing::error!("S3 Upload Error: {:?}", e);
                remote_error(&self.key, e)
            })?;
        Ok(())
    }

    async fn abort_multipart(&self) {
        let Some(upload) = self.upload.as_ref() else {
            return;
        };
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket_name)
            .key(&self.key)
            .upload_id(&upload.upload_id)
            .send()
            .await
        {
            tracing::warn!("Failed to abort multipart upload for {}: {}", self.key, e);
        }
    }
}

#[async_trait]
impl FileSink for S3FileSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), StorageError> {
        if self.upload.is_none() {
            let body = std::mem::take(&mut self.buffer);
            self.client
                .put_object()
                .bucket(&self.bucket_name)
                .key(&self.key)
                .body(ByteStream::from(body))
                .content_type("text/csv")
                .send()
                .await
                .map_err(|e| {
                    tracing::error!("S3 Upload Error: {:?}", e);
                    remote_error(&self.key, e)
                })?;
            return Ok(());
        }

        // an unfinished multipart upload keeps its parts until aborted
        if let Err(e) = self.complete_multipart().await {
            self.abort_multipart().await;
            return Err(e);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        self.abort_multipart().await;
    }
}
