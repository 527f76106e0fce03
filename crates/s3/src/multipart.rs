//! Multipart upload support
//!
//! Streams of unknown length are cut into fixed-size parts. A body that
//! fits in one part goes up as a single PUT; anything larger becomes a
//! multipart upload with a bounded number of parts in flight. Parts hold
//! their bytes in memory, so each one can be retried on its own.

use std::sync::Arc;

use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use bfs_core::config::RetryConfig;
use bfs_core::{ByteStream, Context, Error, LogSink, ObjectInfo, Result, Retrier};

use crate::client::classify;

/// Minimum part size: 5 MiB (S3 requirement)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum part size: 5 GiB
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Default part size: 16 MiB
pub const DEFAULT_PART_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum number of parts: 10,000 (S3 limit)
pub const MAX_PARTS: i32 = 10_000;

/// Multipart upload configuration
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Part size in bytes
    pub part_size: u64,

    /// Number of parts uploaded at once
    pub concurrency: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: 4,
        }
    }
}

impl MultipartConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part_size(mut self, size: u64) -> Self {
        self.part_size = size.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Largest object this configuration can store
    pub fn max_object_size(&self) -> u64 {
        self.part_size * MAX_PARTS as u64
    }
}

/// Read up to `size` bytes. A short part means the stream ended.
pub(crate) async fn read_part(body: &mut ByteStream, size: u64) -> Result<Bytes> {
    let size = usize::try_from(size).map_err(|_| Error::Validation(format!("part size {size}")))?;
    let mut part = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = body
            .read(&mut part[filled..])
            .await
            .map_err(Error::from_io)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    part.truncate(filled);
    Ok(Bytes::from(part))
}

/// Store `data` with one PUT
pub(crate) async fn put_single(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    data: Bytes,
) -> Result<ObjectInfo> {
    let size = data.len() as u64;
    let response = client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(SdkByteStream::from(data))
        .send()
        .await
        .map_err(|e| classify(e, bucket, Some(key)))?;

    let mut info = ObjectInfo::file(key, size).modified(jiff::Timestamp::now());
    info.etag = response.e_tag().map(|e| e.trim_matches('"').to_string());
    Ok(info)
}

/// Caller context of one upload
pub(crate) struct UploadScope<'a> {
    pub ctx: Context,
    pub sink: Arc<dyn LogSink>,
    pub retry: &'a RetryConfig,
}

/// Upload a stream of unknown length
pub(crate) async fn upload_stream(
    client: &aws_sdk_s3::Client,
    config: &MultipartConfig,
    scope: UploadScope<'_>,
    bucket: &str,
    key: &str,
    mut body: ByteStream,
) -> Result<ObjectInfo> {
    let UploadScope { ctx, sink, retry } = scope;
    let retrier = Retrier::new(retry.clone());

    let first = read_part(&mut body, config.part_size).await?;
    if (first.len() as u64) < config.part_size {
        return retrier
            .run(&ctx, sink.as_ref(), "put_object", || {
                put_single(client, bucket, key, first.clone())
            })
            .await;
    }

    ctx.check()?;
    let created = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| classify(e, bucket, Some(key)))?;
    let upload_id = created
        .upload_id()
        .ok_or_else(|| Error::Fatal(format!("no upload id for {bucket}/{key}")))?
        .to_string();

    tracing::debug!(bucket, key, upload_id = %upload_id, "multipart upload started");

    let upload = PartUpload {
        client: client.clone(),
        retrier,
        ctx,
        sink: Arc::clone(&sink),
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id: upload_id.clone(),
    };

    match upload.send_parts(config, first, body).await {
        Ok((parts, size)) => {
            let response = client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| classify(e, bucket, Some(key)))?;

            let mut info = ObjectInfo::file(key, size).modified(jiff::Timestamp::now());
            info.etag = response.e_tag().map(|e| e.trim_matches('"').to_string());
            Ok(info)
        }
        Err(e) => {
            if let Err(abort) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                sink.warn(&format!(
                    "failed to abort multipart upload {upload_id} of {bucket}/{key}: {}",
                    classify(abort, bucket, Some(key))
                ));
            }
            Err(e)
        }
    }
}

/// Wait for room to send another part
async fn acquire_slot(permits: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
    Arc::clone(permits)
        .acquire_owned()
        .await
        .map_err(|_| Error::Fatal("upload pool closed".to_string()))
}

#[derive(Clone)]
struct PartUpload {
    client: aws_sdk_s3::Client,
    retrier: Retrier,
    ctx: Context,
    sink: Arc<dyn LogSink>,
    bucket: String,
    key: String,
    upload_id: String,
}

impl PartUpload {
    async fn send_part(&self, number: i32, data: Bytes) -> Result<CompletedPart> {
        let response = self
            .retrier
            .run(&self.ctx, self.sink.as_ref(), "upload_part", || {
                let request = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(&self.upload_id)
                    .part_number(number)
                    .body(SdkByteStream::from(data.clone()));
                async move {
                    request
                        .send()
                        .await
                        .map_err(|e| classify(e, &self.bucket, Some(&self.key)))
                }
            })
            .await?;

        Ok(CompletedPart::builder()
            .part_number(number)
            .set_e_tag(response.e_tag().map(|s| s.to_string()))
            .build())
    }

    /// Send `first` and the rest of `body` as numbered parts. Returns the
    /// completed parts in order and the total size.
    async fn send_parts(
        &self,
        config: &MultipartConfig,
        first: Bytes,
        mut body: ByteStream,
    ) -> Result<(Vec<CompletedPart>, u64)> {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        let mut tasks: JoinSet<Result<CompletedPart>> = JoinSet::new();
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut next = Some(first);
        let mut number = 0i32;

        let result: Result<()> = async {
            loop {
                let data = match next.take() {
                    Some(data) => data,
                    None => read_part(&mut body, config.part_size).await?,
                };
                if data.is_empty() {
                    break;
                }
                number += 1;
                if number > MAX_PARTS {
                    return Err(Error::Fatal(format!(
                        "{}/{} exceeds {} parts of {} bytes",
                        self.bucket, self.key, MAX_PARTS, config.part_size
                    )));
                }
                total += data.len() as u64;
                let last = (data.len() as u64) < config.part_size;

                let permit = acquire_slot(&permits).await?;

                // Surface failures early instead of reading the whole stream
                while let Some(joined) = tasks.try_join_next() {
                    parts.push(joined.map_err(|e| Error::Fatal(e.to_string()))??);
                }

                let upload = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    upload.send_part(number, data).await
                });

                if last {
                    break;
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tasks.abort_all();
            return Err(e);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(Error::Fatal(e.to_string())),
            }
        }

        parts.sort_by_key(|p| p.part_number());
        tracing::debug!(
            bucket = %self.bucket,
            key = %self.key,
            parts = parts.len(),
            bytes = total,
            "multipart parts uploaded"
        );
        Ok((parts, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(data: Vec<u8>) -> ByteStream {
        Box::pin(std::io::Cursor::new(data))
    }

    #[tokio::test]
    async fn test_closed_pool_is_fatal() {
        let permits = Arc::new(Semaphore::new(1));
        assert!(acquire_slot(&permits).await.is_ok());

        permits.close();
        assert!(matches!(acquire_slot(&permits).await, Err(Error::Fatal(_))));
    }

    #[test]
    fn test_part_size_clamped() {
        assert_eq!(MultipartConfig::new().part_size(1).part_size, MIN_PART_SIZE);
        assert_eq!(
            MultipartConfig::new().part_size(u64::MAX).part_size,
            MAX_PART_SIZE
        );
        assert_eq!(MultipartConfig::new().concurrency(0).concurrency, 1);
    }

    #[test]
    fn test_max_object_size() {
        let config = MultipartConfig::new().part_size(MIN_PART_SIZE);
        assert_eq!(config.max_object_size(), MIN_PART_SIZE * 10_000);
    }

    #[tokio::test]
    async fn test_read_part_splits_stream() {
        let mut body = stream(vec![7u8; 25]);
        assert_eq!(read_part(&mut body, 10).await.unwrap().len(), 10);
        assert_eq!(read_part(&mut body, 10).await.unwrap().len(), 10);
        assert_eq!(read_part(&mut body, 10).await.unwrap().len(), 5);
        assert!(read_part(&mut body, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_part_propagates_io_error() {
        struct Broken;
        impl tokio::io::AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("disk gone")))
            }
        }
        let mut body: ByteStream = Box::pin(Broken);
        assert!(read_part(&mut body, 10).await.is_err());
    }
}
