//! In-memory object backend
//!
//! Keeps buckets and objects in ordered maps so listings come back in key
//! order, like S3. Backs the test suites and any embedding that needs a
//! bucket without a network.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::path::DELIMITER;
use crate::traits::{
    ByteStream, GetObjectOutput, ListOptions, ListResult, ObjectBackend, ObjectInfo,
};

const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified: jiff::Timestamp,
}

#[derive(Debug, Default)]
struct StoredBucket {
    objects: BTreeMap<String, StoredObject>,
    policy: Option<String>,
}

/// Object backend that lives entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: Mutex<HashMap<String, StoredBucket>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored in `bucket`, in order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredBucket>> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_bucket<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut StoredBucket) -> Result<T>,
    ) -> Result<T> {
        let mut buckets = self.lock();
        let stored = buckets
            .get_mut(bucket)
            .ok_or_else(|| Error::NotFound(bucket.to_string()))?;
        f(stored)
    }

    fn store(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectInfo> {
        self.with_bucket(bucket, |b| {
            let modified = jiff::Timestamp::now();
            let info = ObjectInfo::file(key, data.len() as u64).modified(modified);
            b.objects
                .insert(key.to_string(), StoredObject { data, modified });
            Ok(info)
        })
    }
}

fn info_for(key: &str, object: &StoredObject) -> ObjectInfo {
    ObjectInfo::file(key, object.data.len() as u64).modified(object.modified)
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn head_bucket(&self, bucket: &str) -> Result<bool> {
        Ok(self.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut buckets = self.lock();
        if buckets.contains_key(bucket) {
            return Err(Error::AlreadyExists(bucket.to_string()));
        }
        buckets.insert(bucket.to_string(), StoredBucket::default());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let mut buckets = self.lock();
        match buckets.get(bucket) {
            None => Err(Error::NotFound(bucket.to_string())),
            Some(b) if !b.objects.is_empty() => {
                Err(Error::Fatal(format!("bucket {bucket} is not empty")))
            }
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }

    async fn list_objects(&self, bucket: &str, options: &ListOptions) -> Result<ListResult> {
        self.with_bucket(bucket, |b| {
            let prefix = options.prefix.as_deref().unwrap_or("");
            let delimiter = options.delimiter.as_deref();
            let max_keys = options
                .max_keys
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_KEYS);
            let after = options.continuation_token.as_deref();

            let mut result = ListResult::default();
            let mut last_prefix: Option<String> = None;
            let mut last_key: Option<&str> = None;

            for (key, object) in b.objects.range(prefix.to_string()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                if after.is_some_and(|token| key.as_str() <= token) {
                    continue;
                }

                let rest = &key[prefix.len()..];
                let common = delimiter
                    .and_then(|d| rest.find(d).map(|i| &key[..prefix.len() + i + d.len()]));

                if let Some(common) = common {
                    if last_prefix.as_deref() == Some(common) {
                        last_key = Some(key.as_str());
                        continue;
                    }
                    if result.items.len() == max_keys {
                        result.truncated = true;
                        break;
                    }
                    last_prefix = Some(common.to_string());
                    result.items.push(ObjectInfo::dir(common));
                } else {
                    if result.items.len() == max_keys {
                        result.truncated = true;
                        break;
                    }
                    result.items.push(info_for(key, object));
                }
                last_key = Some(key.as_str());
            }

            if result.truncated {
                result.continuation_token = last_key.map(str::to_string);
            }
            Ok(result)
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        self.with_bucket(bucket, |b| {
            b.objects
                .get(key)
                .map(|o| info_for(key, o))
                .ok_or_else(|| Error::NotFound(format!("{bucket}{DELIMITER}{key}")))
        })
    }

    async fn get_object(&self, bucket: &str, key: &str, offset: u64) -> Result<GetObjectOutput> {
        let data = self.with_bucket(bucket, |b| {
            b.objects
                .get(key)
                .map(|o| o.data.clone())
                .ok_or_else(|| Error::NotFound(format!("{bucket}{DELIMITER}{key}")))
        })?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let body = data.slice(start..);
        Ok(GetObjectOutput {
            content_length: Some(body.len() as u64),
            body: Box::pin(std::io::Cursor::new(body)),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectInfo> {
        self.store(bucket, key, data)
    }

    async fn upload_object(
        &self,
        ctx: &Context,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
    ) -> Result<ObjectInfo> {
        if !self.lock().contains_key(bucket) {
            return Err(Error::NotFound(bucket.to_string()));
        }
        let mut data = Vec::new();
        body.read_to_end(&mut data).await.map_err(Error::from_io)?;
        ctx.check()?;
        self.store(bucket, key, Bytes::from(data))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.with_bucket(bucket, |b| {
            b.objects.remove(key);
            Ok(())
        })
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String> {
        self.with_bucket(bucket, |b| {
            if !b.objects.contains_key(key) {
                return Err(Error::NotFound(format!("{bucket}{DELIMITER}{key}")));
            }
            Ok(format!(
                "http://localhost:9000/{bucket}/{key}?X-Amz-Expires={}",
                expires.as_secs()
            ))
        })
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()> {
        self.with_bucket(bucket, |b| {
            b.policy = Some(policy.to_string());
            Ok(())
        })
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<String> {
        self.with_bucket(bucket, |b| {
            b.policy
                .clone()
                .ok_or_else(|| Error::NotFound(format!("policy for {bucket}")))
        })
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        self.with_bucket(bucket, |b| {
            b.policy = None;
            Ok(())
        })
    }
}
