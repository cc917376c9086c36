//! S3 storage provider

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, MetadataDirective,
    ObjectIdentifier, ServerSideEncryption,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;

use super::{
    temp_download_path, validate_buckets, CloudStorageProvider, ObjectInfo, ProviderOptions,
    RequestOp, PROVIDER_S3,
};
use crate::env::CloudEnvOptions;
use crate::file::{CloudReadableFile, CloudWritableFile, FileOptions, ObjectTransport};
use crate::path::list_prefix;
use crate::{Error, Result};

/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH_SIZE: usize = 1000;

struct S3State {
    client: Client,
    region: String,
}

/// S3 provider. Cloning shares the client.
///
/// The SDK client is built lazily: by `prepare`, using the region of the
/// environment's destination (or source) bucket, or on first use with the
/// SDK's default region chain.
#[derive(Clone)]
pub struct S3Provider {
    options: Arc<ProviderOptions>,
    state: Arc<OnceCell<S3State>>,
}

impl S3Provider {
    pub fn new(options: ProviderOptions) -> Self {
        Self {
            options: Arc::new(options),
            state: Arc::new(OnceCell::new()),
        }
    }

    /// True once the SDK client has been built.
    pub fn is_connected(&self) -> bool {
        self.state.initialized()
    }

    async fn connect(&self, region: Option<String>) -> S3State {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }

        let credentials = &self.options.cloud.credentials;
        if let (Some(id), Some(secret)) = (&credentials.access_key_id, &credentials.secret_key) {
            if credentials.has_static_keys() {
                loader = loader.credentials_provider(aws_credential_types::Credentials::new(
                    id.clone(),
                    secret.clone(),
                    credentials.session_token.clone(),
                    None,
                    "cloudenv",
                ));
            }
        }

        let mut timeouts = TimeoutConfig::builder();
        if let Some(timeout) = self.options.connect_timeout() {
            timeouts = timeouts.connect_timeout(timeout);
        }
        if let Some(timeout) = self.options.request_timeout() {
            timeouts = timeouts.operation_timeout(timeout);
        }

        let retry = &self.options.cloud.retry;
        let sdk_config = loader
            .timeout_config(timeouts.build())
            .retry_config(
                RetryConfig::standard()
                    .with_max_attempts(retry.max_attempts.max(1))
                    .with_initial_backoff(Duration::from_millis(retry.initial_backoff_ms))
                    .with_max_backoff(Duration::from_millis(retry.max_backoff_ms)),
            )
            .load()
            .await;

        let region = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_default();

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint_url) = &self.options.cloud.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint_url)
                .force_path_style(true);
        }

        tracing::info!(
            "S3 client initialised (region: {}, endpoint: {})",
            if region.is_empty() { "<default>" } else { region.as_str() },
            self.options.cloud.endpoint.as_deref().unwrap_or("<default>")
        );

        S3State {
            client: Client::from_conf(s3_config_builder.build()),
            region,
        }
    }

    async fn state(&self) -> &S3State {
        self.state.get_or_init(|| self.connect(None)).await
    }

    async fn client(&self) -> &Client {
        &self.state().await.client
    }

    fn record<T>(&self, op: RequestOp, started: Instant, bytes: u64, result: &Result<T>) {
        self.options
            .record_request(op, started, bytes, result.is_ok());
    }

    fn encryption(&self) -> (Option<ServerSideEncryption>, Option<String>) {
        encryption_settings(&self.options)
    }

    /// Full keys under `prefix`, following continuation tokens until the
    /// listing is complete.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let client = self.client().await;
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let started = Instant::now();
            let result = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(&format!("S3 list {}/{} failed", bucket, prefix), e));
            self.record(RequestOp::List, started, 0, &result);
            let page = result?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn download(&self, bucket: &str, path: &str, local_path: &Path) -> Result<u64> {
        let response = self
            .client()
            .await
            .get_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| map_sdk_error(&format!("S3 get {}/{} failed", bucket, path), e))?;

        let expected = response.content_length().map(|len| len.max(0) as u64);
        let mut body = response.body;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_download_path(local_path);
        let mut file = fs::File::create(&tmp).await?;

        let streamed: Result<u64> = async {
            let mut written = 0u64;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| Error::io(format!("S3 body read failed: {}", e)))?
            {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(written)
        }
        .await;
        drop(file);

        let written = match streamed {
            Ok(written) if expected.map_or(true, |len| len == written) => written,
            Ok(written) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(Error::io(format!(
                    "S3 get {}/{} returned {} bytes, expected {}",
                    bucket,
                    path,
                    written,
                    expected.unwrap_or(0)
                )));
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        fs::rename(&tmp, local_path).await?;
        Ok(written)
    }

    async fn upload_file(&self, local_path: &Path, bucket: &str, path: &str) -> Result<u64> {
        let size = fs::metadata(local_path).await?.len();
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| Error::io(format!("failed to open {}: {}", local_path.display(), e)))?;
        let (sse, kms_key) = self.encryption();

        self.client()
            .await
            .put_object()
            .bucket(bucket)
            .key(path)
            .body(body)
            .content_length(size as i64)
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&format!("S3 put {}/{} failed", bucket, path), e))?;

        Ok(size)
    }
}

#[async_trait]
impl CloudStorageProvider for S3Provider {
    fn name(&self) -> &'static str {
        PROVIDER_S3
    }

    fn options(&self) -> &ProviderOptions {
        &self.options
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let state = self.state().await;
        let mut request = state.client.create_bucket().bucket(bucket);
        if !state.region.is_empty() && state.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(state.region.as_str()))
                    .build(),
            );
        }

        let started = Instant::now();
        let result = match request.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(e) => Err(map_sdk_error(&format!("S3 create bucket {} failed", bucket), e)),
        };
        self.record(RequestOp::Create, started, 0, &result);
        result
    }

    async fn exists_bucket(&self, bucket: &str) -> Result<()> {
        let client = self.client().await;
        let started = Instant::now();
        let result = client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error(&format!("S3 head bucket {} failed", bucket), e));
        self.record(RequestOp::Info, started, 0, &result);
        result
    }

    async fn empty_bucket(&self, bucket: &str, path_prefix: &str) -> Result<()> {
        let keys = self.list_keys(bucket, &list_prefix(path_prefix)).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let client = self.client().await;
        let mut deleted = 0usize;

        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::internal(format!("invalid object identifier: {}", e)))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| Error::internal(format!("invalid delete request: {}", e)))?;

            let started = Instant::now();
            let result = client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error(&format!("S3 delete objects in {} failed", bucket), e));
            self.record(RequestOp::Delete, started, 0, &result);

            let response = match result {
                Ok(response) => response,
                Err(e) if deleted > 0 => {
                    return Err(Error::partial(format!(
                        "emptied {} of {} objects in {}: {}",
                        deleted,
                        keys.len(),
                        bucket,
                        e
                    )));
                }
                Err(e) => return Err(e),
            };
            if !response.errors().is_empty() {
                return Err(Error::partial(format!(
                    "{} objects in {} could not be deleted",
                    response.errors().len(),
                    bucket
                )));
            }
            deleted += chunk.len();
        }

        tracing::debug!("Emptied {} objects from {}/{}", deleted, bucket, path_prefix);
        Ok(())
    }

    async fn delete_cloud_object(&self, bucket: &str, path: &str) -> Result<()> {
        // S3 reports success for missing keys; probe first so absence is visible.
        self.exists_cloud_object(bucket, path).await?;

        let client = self.client().await;
        let started = Instant::now();
        let result = client
            .delete_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error(&format!("S3 delete {}/{} failed", bucket, path), e));
        self.record(RequestOp::Delete, started, 0, &result);
        result
    }

    async fn list_cloud_objects(&self, bucket: &str, path_prefix: &str) -> Result<Vec<String>> {
        let prefix = list_prefix(path_prefix);
        let keys = self.list_keys(bucket, &prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()).map(|k| k.to_string()))
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn get_cloud_object_metadata(&self, bucket: &str, path: &str) -> Result<ObjectInfo> {
        let client = self.client().await;
        let started = Instant::now();
        let result = client
            .head_object()
            .bucket(bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| map_sdk_error(&format!("S3 head {}/{} failed", bucket, path), e));
        self.record(RequestOp::Info, started, 0, &result);
        let head = result?;

        let modification_time = head
            .last_modified()
            .and_then(|t| t.to_millis().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_default();

        Ok(ObjectInfo {
            size: head.content_length().unwrap_or(0).max(0) as u64,
            modification_time,
            content_hash: head.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            metadata: head.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn copy_cloud_object(
        &self,
        src_bucket: &str,
        src_path: &str,
        dst_bucket: &str,
        dst_path: &str,
    ) -> Result<()> {
        let client = self.client().await;
        let (sse, kms_key) = self.encryption();
        let started = Instant::now();
        let result = client
            .copy_object()
            .copy_source(copy_source(src_bucket, src_path))
            .bucket(dst_bucket)
            .key(dst_path)
            .metadata_directive(MetadataDirective::Copy)
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                map_sdk_error(
                    &format!(
                        "S3 copy {}/{} -> {}/{} failed",
                        src_bucket, src_path, dst_bucket, dst_path
                    ),
                    e,
                )
            });
        self.record(RequestOp::Copy, started, 0, &result);
        result
    }

    async fn get_cloud_object(&self, bucket: &str, path: &str, local_path: &Path) -> Result<()> {
        let started = Instant::now();
        let result = self.download(bucket, path, local_path).await;
        let bytes = *result.as_ref().unwrap_or(&0);
        self.record(RequestOp::Read, started, bytes, &result);
        result.map(|_| ())
    }

    async fn put_cloud_object(&self, local_path: &Path, bucket: &str, path: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.upload_file(local_path, bucket, path).await;
        let bytes = *result.as_ref().unwrap_or(&0);
        self.record(RequestOp::Write, started, bytes, &result);
        result.map(|_| ())
    }

    async fn put_cloud_object_metadata(
        &self,
        bucket: &str,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let client = self.client().await;
        let (sse, kms_key) = self.encryption();
        let started = Instant::now();
        // S3 metadata is immutable; copying onto itself with REPLACE swaps it.
        let result = client
            .copy_object()
            .copy_source(copy_source(bucket, path))
            .bucket(bucket)
            .key(path)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| map_sdk_error(&format!("S3 set metadata {}/{} failed", bucket, path), e));
        self.record(RequestOp::Write, started, 0, &result);
        result
    }

    async fn new_cloud_writable_file(
        &self,
        local_path: &Path,
        bucket: &str,
        path: &str,
        options: FileOptions,
    ) -> Result<CloudWritableFile> {
        CloudWritableFile::create(local_path, bucket, path, options, Arc::new(self.clone())).await
    }

    async fn new_cloud_readable_file(
        &self,
        bucket: &str,
        path: &str,
        options: FileOptions,
    ) -> Result<CloudReadableFile> {
        let size = self.get_cloud_object_size(bucket, path).await?;
        Ok(CloudReadableFile::new(
            bucket,
            path,
            size,
            options,
            Arc::new(self.clone()),
        ))
    }

    fn dump(&self) {
        self.options.dump(PROVIDER_S3);
        if let Some(state) = self.state.get() {
            tracing::info!("S3 region: {}", state.region);
        }
    }

    async fn prepare(&self, env: &CloudEnvOptions) -> Result<()> {
        let descriptor = if env.dest_bucket.is_valid() {
            &env.dest_bucket
        } else {
            &env.src_bucket
        };
        let region = Some(descriptor.region().to_string()).filter(|r| !r.is_empty());

        let state = self.state.get_or_init(|| self.connect(region.clone())).await;
        if let Some(region) = &region {
            if &state.region != region {
                tracing::warn!(
                    "S3 client already bound to region {}, bucket region is {}",
                    state.region,
                    region
                );
            }
        }

        validate_buckets(self, env).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl ObjectTransport for S3Provider {
    async fn read_range(&self, bucket: &str, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let client = self.client().await;
        let started = Instant::now();
        let result: Result<Bytes> = async {
            let response = client
                .get_object()
                .bucket(bucket)
                .key(path)
                .range(format!("bytes={}-{}", offset, offset + len - 1))
                .send()
                .await
                .map_err(|e| map_sdk_error(&format!("S3 range get {}/{} failed", bucket, path), e))?;
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| Error::io(format!("S3 body read failed: {}", e)))?;
            Ok(data.into_bytes())
        }
        .await;
        let bytes = result.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        self.record(RequestOp::Read, started, bytes, &result);
        result
    }

    async fn upload(&self, local_path: &Path, bucket: &str, path: &str) -> Result<()> {
        self.put_cloud_object(local_path, bucket, path).await
    }
}

/// `x-amz-copy-source` value: the key is URL-encoded segment by segment so
/// separators survive.
fn copy_source(bucket: &str, key: &str) -> String {
    let key = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", bucket, key)
}

/// Server-side encryption headers: KMS when a key id is configured, S3-managed
/// keys otherwise.
fn encryption_settings(options: &ProviderOptions) -> (Option<ServerSideEncryption>, Option<String>) {
    if !options.server_side_encryption {
        return (None, None);
    }
    match options.encryption_key_id.as_deref() {
        Some(key) if !key.is_empty() => (Some(ServerSideEncryption::AwsKms), Some(key.to_string())),
        _ => (Some(ServerSideEncryption::Aes256), None),
    }
}

/// Classify an SDK failure: absence, credential/config problems, or a
/// transient transport error.
fn map_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            match service.err().code() {
                Some("NoSuchKey") | Some("NoSuchBucket") | Some("NotFound") => {
                    Error::not_found(message)
                }
                Some("AccessDenied")
                | Some("InvalidAccessKeyId")
                | Some("SignatureDoesNotMatch")
                | Some("ExpiredToken")
                | Some("InvalidBucketName") => Error::invalid_config(message),
                _ if status == 404 => Error::not_found(message),
                _ if status == 401 || status == 403 => Error::invalid_config(message),
                _ => Error::io(message),
            }
        }
        SdkError::ConstructionFailure(_) => Error::invalid_config(message),
        _ => Error::io(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{cast_as, PROVIDER_OPTIONS_KEY};

    #[test]
    fn test_construction_does_not_connect() {
        let provider = S3Provider::new(ProviderOptions::default());
        assert!(!provider.is_connected());
        assert_eq!(provider.name(), PROVIDER_S3);
    }

    #[test]
    fn test_encryption_settings() {
        let mut options = ProviderOptions::default();
        assert_eq!(encryption_settings(&options), (None, None));

        options.server_side_encryption = true;
        assert_eq!(
            encryption_settings(&options),
            (Some(ServerSideEncryption::Aes256), None)
        );

        options.encryption_key_id = Some("kms-key".to_string());
        assert_eq!(
            encryption_settings(&options),
            (Some(ServerSideEncryption::AwsKms), Some("kms-key".to_string()))
        );
    }

    #[test]
    fn test_copy_source_encodes_key() {
        assert_eq!(copy_source("db.live", "base/000001.sst"), "db.live/base/000001.sst");
        assert_eq!(
            copy_source("db.live", "base/a b+c%.sst"),
            "db.live/base/a%20b%2Bc%25.sst"
        );
        assert_eq!(copy_source("db.live", "base/été"), "db.live/base/%C3%A9t%C3%A9");
    }

    #[test]
    fn test_options_lookup_through_trait_object() {
        let options = ProviderOptions {
            request_timeout_ms: 1234,
            ..ProviderOptions::default()
        };
        let provider: Arc<dyn CloudStorageProvider> = Arc::new(S3Provider::new(options));

        let found = provider
            .get_options(PROVIDER_OPTIONS_KEY)
            .and_then(|option| option.downcast::<ProviderOptions>())
            .unwrap();
        assert_eq!(found.request_timeout_ms, 1234);
        assert!(provider.get_options("missing").is_none());
        assert!(cast_as::<S3Provider>(provider.as_ref(), PROVIDER_S3).is_some());
    }
}
