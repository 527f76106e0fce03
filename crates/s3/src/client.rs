//! S3 backend implementation
//!
//! Wraps aws-sdk-s3 and implements the ObjectBackend trait from bfs-core.
//! SDK-level retries are disabled; the bfs-core client owns the retry
//! policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use bytes::Bytes;

use bfs_core::config::{Config, RetryConfig};
use bfs_core::{
    ByteStream, Context, Error, GetObjectOutput, ListOptions, ListResult, LogSink, ObjectBackend,
    ObjectInfo, Result, TracingSink,
};

use crate::multipart::{self, MultipartConfig};

const DEFAULT_REGION: &str = "us-east-1";

/// Error codes that retrying cannot fix
const FATAL_CODES: &[&str] = &[
    "AccessDenied",
    "BadRequest",
    "BucketNotEmpty",
    "EntityTooLarge",
    "EntityTooSmall",
    "InvalidAccessKeyId",
    "InvalidArgument",
    "InvalidBucketName",
    "InvalidRequest",
    "KeyTooLongError",
    "MalformedPolicy",
    "MalformedXML",
    "SignatureDoesNotMatch",
];

/// S3 backend
pub struct S3Backend {
    inner: aws_sdk_s3::Client,
    region: String,
    multipart: MultipartConfig,
    retry: RetryConfig,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("region", &self.region)
            .field("multipart", &self.multipart)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a backend from the `[remote]`, `[timeout]` and `[transfer]`
    /// settings
    pub async fn new(config: &Config) -> Result<Self> {
        let remote = &config.remote;

        let credentials = aws_credential_types::Credentials::new(
            remote.access_key.clone(),
            remote.secret_key.clone(),
            None, // session token
            None, // expiry
            "bfs-static-credentials",
        );

        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .connect_timeout(Duration::from_millis(config.timeout.connect_ms))
            .read_timeout(Duration::from_millis(config.timeout.read_ms))
            .build();

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(aws_config::Region::new(remote.region.clone()))
            .endpoint_url(&remote.endpoint)
            .timeout_config(timeouts)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;

        // Path-style addressing for S3-compatible servers
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(remote.bucket_lookup == "path" || remote.bucket_lookup == "auto")
            .build();

        tracing::debug!(endpoint = %remote.endpoint, region = %remote.region, "s3 backend ready");

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(s3_config),
            region: remote.region.clone(),
            multipart: MultipartConfig::new()
                .part_size(config.transfer.part_size)
                .concurrency(config.transfer.upload_concurrency),
            retry: config.retry.clone(),
            sink: Arc::new(TracingSink),
        })
    }

    /// Report part retries and abort failures to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }
}

/// Map an SDK failure into the bfs taxonomy
pub(crate) fn classify<E, R>(err: SdkError<E, R>, bucket: &str, key: Option<&str>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    if matches!(err, SdkError::ConstructionFailure(_)) {
        return Error::Fatal(message);
    }
    match err.code() {
        Some("NoSuchBucket") => Error::NotFound(bucket.to_string()),
        Some("NoSuchKey" | "NotFound") => match key {
            Some(key) => Error::NotFound(format!("{bucket}/{key}")),
            None => Error::NotFound(bucket.to_string()),
        },
        Some("NoSuchBucketPolicy") => Error::NotFound(format!("policy for {bucket}")),
        Some(code) if FATAL_CODES.contains(&code) => Error::Fatal(message),
        _ => Error::Transient(message),
    }
}

pub(crate) fn to_timestamp(dt: &aws_smithy_types::DateTime) -> Option<jiff::Timestamp> {
    jiff::Timestamp::new(dt.secs(), i32::try_from(dt.subsec_nanos()).unwrap_or(0)).ok()
}

fn size_of(size: Option<i64>) -> u64 {
    size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0)
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_bucket(&self, bucket: &str) -> Result<bool> {
        match self.inner.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e, bucket, None) {
                Error::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut request = self.inner.create_bucket().bucket(bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| classify(e, bucket, None))?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.inner
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify(e, bucket, None))?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, options: &ListOptions) -> Result<ListResult> {
        let mut request = self.inner.list_objects_v2().bucket(bucket);

        if let Some(prefix) = &options.prefix {
            request = request.prefix(prefix);
        }
        if let Some(delimiter) = &options.delimiter {
            request = request.delimiter(delimiter);
        }
        if let Some(max) = options.max_keys {
            request = request.max_keys(max);
        }
        if let Some(token) = &options.continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify(e, bucket, None))?;

        let mut items = Vec::new();

        // Common prefixes are the sub-directories of a delimited listing
        for prefix in response.common_prefixes() {
            if let Some(p) = prefix.prefix() {
                items.push(ObjectInfo::dir(p));
            }
        }

        for object in response.contents() {
            let mut info = ObjectInfo::file(object.key().unwrap_or_default(), size_of(object.size()));
            info.last_modified = object.last_modified().and_then(to_timestamp);
            info.etag = object.e_tag().map(trim_etag);
            items.push(info);
        }

        Ok(ListResult {
            items,
            truncated: response.is_truncated().unwrap_or(false),
            continuation_token: response.next_continuation_token().map(|s| s.to_string()),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let response = self
            .inner
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, Some(key)))?;

        let mut info = ObjectInfo::file(key, size_of(response.content_length()));
        info.last_modified = response.last_modified().and_then(to_timestamp);
        info.etag = response.e_tag().map(trim_etag);
        info.content_type = response.content_type().map(|s| s.to_string());
        Ok(info)
    }

    async fn get_object(&self, bucket: &str, key: &str, offset: u64) -> Result<GetObjectOutput> {
        let mut request = self.inner.get_object().bucket(bucket).key(key);
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            // Reading at or past the end yields nothing
            Err(e) if e.code() == Some("InvalidRange") => {
                return Ok(GetObjectOutput {
                    body: Box::pin(tokio::io::empty()),
                    content_length: Some(0),
                });
            }
            Err(e) => return Err(classify(e, bucket, Some(key))),
        };

        let content_length = response
            .content_length()
            .and_then(|n| u64::try_from(n).ok());
        Ok(GetObjectOutput {
            body: Box::pin(response.body.into_async_read()),
            content_length,
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectInfo> {
        multipart::put_single(&self.inner, bucket, key, data).await
    }

    async fn upload_object(
        &self,
        ctx: &Context,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> Result<ObjectInfo> {
        let scope = multipart::UploadScope {
            ctx: ctx.clone(),
            sink: Arc::clone(&self.sink),
            retry: &self.retry,
        };
        multipart::upload_stream(&self.inner, &self.multipart, scope, bucket, key, body).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, Some(key)))?;
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(expires)
            .map_err(|e| Error::Validation(format!("invalid expiry {expires:?}: {e}")))?;
        let request = self
            .inner
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| classify(e, bucket, Some(key)))?;
        Ok(request.uri().to_string())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()> {
        self.inner
            .put_bucket_policy()
            .bucket(bucket)
            .policy(policy)
            .send()
            .await
            .map_err(|e| classify(e, bucket, None))?;
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<String> {
        let response = self
            .inner
            .get_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify(e, bucket, None))?;
        Ok(response.policy().unwrap_or_default().to_string())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        self.inner
            .delete_bucket_policy()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify(e, bucket, None))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_s3::operation::get_object::GetObjectError;
    use aws_sdk_s3::operation::head_bucket::HeadBucketError;
    use aws_sdk_s3::types::error::{NoSuchBucket, NoSuchKey, NotFound};
    use aws_smithy_types::error::ErrorMetadata;

    use super::*;

    fn service_error<E>(err: E) -> SdkError<E, ()> {
        SdkError::service_error(err, ())
    }

    #[test]
    fn test_no_such_bucket_maps_to_bucket_not_found() {
        let err = GetObjectError::NoSuchKey(
            NoSuchKey::builder()
                .meta(ErrorMetadata::builder().code("NoSuchBucket").build())
                .build(),
        );
        let mapped = classify(service_error(err), "photos", Some("a.jpg"));
        assert!(matches!(mapped, Error::NotFound(b) if b == "photos"));
    }

    #[test]
    fn test_no_such_key_maps_to_object_not_found() {
        let err = GetObjectError::NoSuchKey(
            NoSuchKey::builder()
                .meta(ErrorMetadata::builder().code("NoSuchKey").build())
                .build(),
        );
        let mapped = classify(service_error(err), "photos", Some("a.jpg"));
        assert!(matches!(mapped, Error::NotFound(k) if k == "photos/a.jpg"));
    }

    #[test]
    fn test_head_not_found() {
        let err = HeadBucketError::NotFound(
            NotFound::builder()
                .meta(ErrorMetadata::builder().code("NotFound").build())
                .build(),
        );
        assert!(matches!(
            classify(service_error(err), "photos", None),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_bad_request_is_fatal_and_throttling_transient() {
        let bad = GetObjectError::generic(ErrorMetadata::builder().code("InvalidArgument").build());
        assert!(matches!(
            classify(service_error(bad), "photos", Some("k")),
            Error::Fatal(_)
        ));

        let slow = GetObjectError::generic(ErrorMetadata::builder().code("SlowDown").build());
        assert!(matches!(
            classify(service_error(slow), "photos", Some("k")),
            Error::Transient(_)
        ));
    }

    #[test]
    fn test_construction_failure_is_fatal() {
        let err: SdkError<GetObjectError, ()> =
            SdkError::construction_failure(std::io::Error::other("missing bucket"));
        assert!(matches!(classify(err, "photos", None), Error::Fatal(_)));
    }

    #[test]
    fn test_no_such_bucket_variant_code() {
        let err = aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error::NoSuchBucket(
            NoSuchBucket::builder()
                .meta(ErrorMetadata::builder().code("NoSuchBucket").build())
                .build(),
        );
        assert!(matches!(
            classify(service_error(err), "photos", None),
            Error::NotFound(b) if b == "photos"
        ));
    }

    #[derive(Default)]
    struct Lines(std::sync::Mutex<Vec<String>>);

    impl LogSink for Lines {
        fn debug(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }

        fn warn(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    async fn unreachable_backend(sink: Arc<Lines>) -> S3Backend {
        let mut config = Config::default();
        config.remote.endpoint = "http://127.0.0.1:1".to_string();
        config.remote.access_key = "accesskey".to_string();
        config.remote.secret_key = "secretkey".to_string();
        config.remote.bucket_lookup = "path".to_string();
        config.retry = RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_elapsed_ms: 1_000,
        };
        config.timeout.connect_ms = 500;
        S3Backend::new(&config).await.unwrap().with_sink(sink)
    }

    fn small_body() -> ByteStream {
        Box::pin(std::io::Cursor::new(b"small".to_vec()))
    }

    #[tokio::test]
    async fn test_upload_stops_on_cancelled_context() {
        let backend = unreachable_backend(Arc::new(Lines::default())).await;
        let ctx = Context::new();
        ctx.cancel();

        let result = backend.upload_object(&ctx, "photos", "a.jpg", small_body()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_upload_retries_report_to_backend_sink() {
        let lines = Arc::new(Lines::default());
        let backend = unreachable_backend(lines.clone()).await;

        let result = backend
            .upload_object(&Context::new(), "photos", "a.jpg", small_body())
            .await;
        assert!(matches!(result, Err(Error::Transient(_))));

        let lines = lines.0.lock().unwrap();
        assert!(lines.iter().any(|l| l.starts_with("put_object: attempt 1 failed")));
    }

    #[test]
    fn test_timestamp_conversion() {
        let dt = aws_smithy_types::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_timestamp(&dt).unwrap().as_second(), 1_700_000_000);
    }
}
