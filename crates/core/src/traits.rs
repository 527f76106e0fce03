//! ObjectBackend trait definition
//!
//! This trait is the raw, SDK-facing side of the object store: one method per
//! remote call, no retries, no path cleaning. The [`Client`](crate::Client)
//! layers the bucketfs contracts on top of it, which keeps the S3 adapter thin
//! and lets the core be tested against a mock or in-memory backend.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::context::Context;
use crate::error::Result;

/// A raw, unaccounted object byte stream
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// A bucket known to exist on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name
    pub name: String,
}

/// Metadata for an object or a listed prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object key or prefix
    pub key: String,

    /// Size in bytes (None for prefixes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Human-readable size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_human: Option<String>,

    /// Last modified timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<jiff::Timestamp>,

    /// ETag (usually MD5 for single-part uploads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// Content type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Whether this is a common prefix rather than an object
    pub is_dir: bool,
}

impl ObjectInfo {
    /// Create a new ObjectInfo for an object
    pub fn file(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size_bytes: Some(size),
            size_human: Some(humansize::format_size(size, humansize::BINARY)),
            last_modified: None,
            etag: None,
            content_type: None,
            is_dir: false,
        }
    }

    /// Create a new ObjectInfo for a common prefix
    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size_bytes: None,
            size_human: None,
            last_modified: None,
            etag: None,
            content_type: None,
            is_dir: true,
        }
    }

    /// Set the modification time
    pub fn modified(mut self, ts: jiff::Timestamp) -> Self {
        self.last_modified = Some(ts);
        self
    }
}

/// Result of a list operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResult {
    /// Listed objects and common prefixes
    pub items: Vec<ObjectInfo>,

    /// Whether the result is truncated (more items available)
    pub truncated: bool,

    /// Continuation token for pagination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
}

/// Options for list operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Prefix to filter by
    pub prefix: Option<String>,

    /// Delimiter for grouping (None lists recursively)
    pub delimiter: Option<String>,

    /// Continuation token for pagination
    pub continuation_token: Option<String>,

    /// Maximum number of keys to return per request
    pub max_keys: Option<i32>,
}

/// Body of a get call
pub struct GetObjectOutput {
    /// Object bytes starting at the requested offset
    pub body: ByteStream,

    /// Length of the returned body, when the backend declares it
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Raw object-store operations
///
/// Implementations map backend faults into the bfs error taxonomy:
/// missing buckets and keys become `NotFound`, malformed requests `Fatal`,
/// everything else `Transient`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Check if a bucket exists
    async fn head_bucket(&self, bucket: &str) -> Result<bool>;

    /// Create a bucket
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Delete an empty bucket
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    /// List one page of objects
    async fn list_objects(&self, bucket: &str, options: &ListOptions) -> Result<ListResult>;

    /// Get object metadata
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;

    /// Open an object body starting at `offset`
    async fn get_object(&self, bucket: &str, key: &str, offset: u64) -> Result<GetObjectOutput>;

    /// Store an object from memory
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<ObjectInfo>;

    /// Store an object from a stream of unknown length. Work the backend
    /// retries on its own stops once `ctx` is cancelled.
    async fn upload_object(
        &self,
        ctx: &Context,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> Result<ObjectInfo>;

    /// Delete an object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Produce a presigned GET URL
    async fn presign_get(&self, bucket: &str, key: &str, expires: Duration) -> Result<String>;

    /// Attach an access policy document to a bucket
    async fn put_bucket_policy(&self, bucket: &str, policy: &str) -> Result<()>;

    /// Read the access policy document of a bucket
    async fn get_bucket_policy(&self, bucket: &str) -> Result<String>;

    /// Remove the access policy of a bucket
    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_file() {
        let info = ObjectInfo::file("test.txt", 1024);
        assert_eq!(info.key, "test.txt");
        assert_eq!(info.size_bytes, Some(1024));
        assert!(!info.is_dir);
    }

    #[test]
    fn test_object_info_dir() {
        let info = ObjectInfo::dir("path/to/dir/");
        assert_eq!(info.key, "path/to/dir/");
        assert!(info.is_dir);
        assert!(info.size_bytes.is_none());
    }

    #[test]
    fn test_object_info_json_skips_empty_fields() {
        let json = serde_json::to_value(ObjectInfo::dir("a/")).unwrap();
        assert_eq!(json, serde_json::json!({ "key": "a/", "is_dir": true }));
    }
}
