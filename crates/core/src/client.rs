//! Resilient object-store client
//!
//! [`Client`] sits between callers and an [`ObjectBackend`]. It validates
//! bucket names, cleans object paths, retries transient failures with
//! backoff, and reports every failed call to the injected [`LogSink`].
//! Backends only speak raw operations; none of that policy lives there.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{Config, TransferConfig};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::path::{validate_bucket_name, ObjectPath, DELIMITER};
use crate::policy::BucketPolicy;
use crate::retry::Retrier;
use crate::sink::{tracing_sink, LogSink};
use crate::traits::{
    Bucket, ByteStream, GetObjectOutput, ListOptions, ListResult, ObjectBackend, ObjectInfo,
};

/// Object-store client with validation, retry and logging
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn ObjectBackend>,
    retrier: Retrier,
    transfer: TransferConfig,
    external_url: Option<Url>,
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("retrier", &self.retrier)
            .field("transfer", &self.transfer)
            .field("external_url", &self.external_url)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over `backend` using the retry, transfer and remote
    /// settings of `config`
    pub fn new(backend: Arc<dyn ObjectBackend>, config: &Config) -> Result<Self> {
        let external_url = config
            .remote
            .external_url
            .as_deref()
            .map(Url::parse)
            .transpose()?;
        Ok(Self {
            backend,
            retrier: Retrier::new(config.retry.clone()),
            transfer: config.transfer.clone(),
            external_url,
            sink: tracing_sink(),
        })
    }

    /// Replace the log sink
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn transfer(&self) -> &TransferConfig {
        &self.transfer
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    /// Run a backend call under the retry policy, warning on failure
    async fn call<T, F, Fut>(&self, ctx: &Context, op: &str, target: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.retrier.run(ctx, self.sink.as_ref(), op, f).await;
        if let Err(err) = &result {
            self.sink.warn(&format!("{op} {target}: {err}"));
        }
        result
    }

    fn object_path(bucket: &str, path: &str) -> Result<ObjectPath> {
        validate_bucket_name(bucket)?;
        let object = ObjectPath::new(bucket, path);
        if object.is_root() {
            return Err(Error::Validation(format!(
                "object path required in bucket {bucket}"
            )));
        }
        Ok(object)
    }

    // ==================== Buckets ====================

    /// Whether `name` exists
    pub async fn head_bucket(&self, ctx: &Context, name: &str) -> Result<bool> {
        validate_bucket_name(name)?;
        self.call(ctx, "head_bucket", name, || self.backend.head_bucket(name))
            .await
    }

    /// Create a bucket owned by `user`
    pub async fn create_bucket(&self, ctx: &Context, user: &str, name: &str) -> Result<Bucket> {
        validate_bucket_name(name)?;
        if self.head_bucket(ctx, name).await? {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.sink.debug(&format!("create_bucket {name} for {user}"));
        self.call(ctx, "create_bucket", name, || self.backend.create_bucket(name))
            .await?;
        Ok(Bucket {
            name: name.to_string(),
        })
    }

    /// Empty and remove a bucket.
    ///
    /// Pages are processed in listing order. Deletes of one page fan out over
    /// a pool bounded by `transfer.delete_concurrency`; the first failure
    /// aborts the rest of the page and fails the call, leaving the bucket in
    /// place.
    pub async fn delete_bucket(&self, ctx: &Context, user: &str, name: &str) -> Result<()> {
        validate_bucket_name(name)?;
        if !self.head_bucket(ctx, name).await? {
            return Err(Error::NotFound(name.to_string()));
        }
        self.sink.debug(&format!("delete_bucket {name} for {user}"));

        let pool = Arc::new(Semaphore::new(self.transfer.delete_concurrency.max(1)));
        let mut options = ListOptions::default();
        loop {
            let page = self.list_objects(ctx, name, &options).await?;
            let keys = page.items.into_iter().map(|item| item.key).collect();
            self.delete_page(ctx, name, keys, &pool).await?;

            match page.continuation_token {
                Some(token) if page.truncated => options.continuation_token = Some(token),
                _ => break,
            }
        }

        self.call(ctx, "delete_bucket", name, || self.backend.delete_bucket(name))
            .await
    }

    async fn delete_page(
        &self,
        ctx: &Context,
        bucket: &str,
        keys: Vec<String>,
        pool: &Arc<Semaphore>,
    ) -> Result<()> {
        let failed = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for key in keys {
            let permit = Arc::clone(pool)
                .acquire_owned()
                .await
                .map_err(|_| Error::Fatal("delete pool closed".into()))?;
            if failed.is_cancelled() || ctx.is_cancelled() {
                break;
            }

            let client = self.clone();
            let ctx = ctx.clone();
            let bucket = bucket.to_string();
            let failed = failed.clone();
            tasks.spawn(async move {
                let result = client.delete_key(&ctx, &bucket, &key).await;
                if result.is_err() {
                    failed.cancel();
                }
                drop(permit);
                result
            });
        }

        if failed.is_cancelled() {
            tasks.abort_all();
        }
        let mut first = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Err(Error::Fatal(format!("delete task failed: {e}"))),
            };
            if let Err(err) = outcome {
                if first.is_none() {
                    tasks.abort_all();
                    first = Some(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => ctx.check(),
        }
    }

    async fn delete_key(&self, ctx: &Context, bucket: &str, key: &str) -> Result<()> {
        let target = format!("{bucket}{DELIMITER}{key}");
        self.call(ctx, "delete_object", &target, || {
            self.backend.delete_object(bucket, key)
        })
        .await
    }

    // ==================== Objects ====================

    /// Store `data` at `path`
    pub async fn put_object(
        &self,
        ctx: &Context,
        user: &str,
        bucket: &str,
        path: &str,
        data: Bytes,
    ) -> Result<ObjectInfo> {
        let object = Self::object_path(bucket, path)?;
        self.sink
            .debug(&format!("put_object {object} ({} bytes) for {user}", data.len()));
        self.call(ctx, "put_object", &object.to_string(), || {
            self.backend
                .put_object(&object.bucket, &object.key, data.clone())
        })
        .await
    }

    /// Stream `body` to `path`.
    ///
    /// A stream cannot be replayed, so the upload is attempted once; the
    /// backend retries individual parts.
    pub async fn upload_object(
        &self,
        ctx: &Context,
        user: &str,
        bucket: &str,
        path: &str,
        body: ByteStream,
    ) -> Result<ObjectInfo> {
        let object = Self::object_path(bucket, path)?;
        ctx.check()?;
        self.sink.debug(&format!("upload_object {object} for {user}"));
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            r = self.backend.upload_object(ctx, &object.bucket, &object.key, body) => r,
        };
        if let Err(err) = &result {
            self.sink.warn(&format!("upload_object {object}: {err}"));
        }
        result
    }

    /// Read a whole object into memory.
    ///
    /// The buffer is sized from the object's declared length; a body that is
    /// shorter or longer than declared is a fatal inconsistency.
    pub async fn get_object(
        &self,
        ctx: &Context,
        user: &str,
        bucket: &str,
        path: &str,
    ) -> Result<Bytes> {
        let object = Self::object_path(bucket, path)?;
        self.sink.debug(&format!("get_object {object} for {user}"));
        self.call(ctx, "get_object", &object.to_string(), || {
            read_declared(self.backend.as_ref(), &object)
        })
        .await
    }

    /// Open an object body at `offset`
    pub async fn open_object(
        &self,
        ctx: &Context,
        bucket: &str,
        path: &str,
        offset: u64,
    ) -> Result<GetObjectOutput> {
        let object = Self::object_path(bucket, path)?;
        self.call(ctx, "open_object", &object.to_string(), || {
            self.backend.get_object(&object.bucket, &object.key, offset)
        })
        .await
    }

    /// Object metadata
    pub async fn head_object(&self, ctx: &Context, bucket: &str, path: &str) -> Result<ObjectInfo> {
        let object = Self::object_path(bucket, path)?;
        self.call(ctx, "head_object", &object.to_string(), || {
            self.backend.head_object(&object.bucket, &object.key)
        })
        .await
    }

    /// Remove an object
    pub async fn delete_object(
        &self,
        ctx: &Context,
        user: &str,
        bucket: &str,
        path: &str,
    ) -> Result<()> {
        let object = Self::object_path(bucket, path)?;
        self.sink.debug(&format!("delete_object {object} for {user}"));
        self.delete_key(ctx, &object.bucket, &object.key).await
    }

    /// One listing page
    pub async fn list_objects(
        &self,
        ctx: &Context,
        bucket: &str,
        options: &ListOptions,
    ) -> Result<ListResult> {
        validate_bucket_name(bucket)?;
        self.call(ctx, "list_objects", bucket, || {
            self.backend.list_objects(bucket, options)
        })
        .await
    }

    /// Every entry under `path`, following continuation tokens.
    ///
    /// With `recursive` unset the listing stops at the next delimiter and
    /// sub-directories come back as directory entries.
    pub async fn list_all(
        &self,
        ctx: &Context,
        bucket: &str,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>> {
        let mut options = ListOptions {
            prefix: ObjectPath::new(bucket, path).list_prefix(),
            delimiter: (!recursive).then(|| DELIMITER.to_string()),
            ..Default::default()
        };
        let mut items = Vec::new();
        loop {
            let page = self.list_objects(ctx, bucket, &options).await?;
            items.extend(page.items);
            match page.continuation_token {
                Some(token) if page.truncated => options.continuation_token = Some(token),
                _ => return Ok(items),
            }
        }
    }

    /// Time-limited download URL.
    ///
    /// Defaults to `transfer.share_expiry_secs`. When an external URL is
    /// configured its scheme, host and port replace those of the signed URL.
    pub async fn presign_object(
        &self,
        ctx: &Context,
        user: &str,
        bucket: &str,
        path: &str,
        expiry: Option<Duration>,
    ) -> Result<String> {
        let object = Self::object_path(bucket, path)?;
        let expiry = expiry.unwrap_or_else(|| self.transfer.share_expiry());
        self.sink
            .debug(&format!("presign_object {object} for {user}, expires in {expiry:?}"));
        let signed = self
            .call(ctx, "presign_object", &object.to_string(), || {
                self.backend.presign_get(&object.bucket, &object.key, expiry)
            })
            .await?;
        match &self.external_url {
            Some(external) => rewrite_origin(&signed, external),
            None => Ok(signed),
        }
    }

    // ==================== Policies ====================

    /// Render the policy for a bucket owned by `owner` and shared read-only
    /// with `shares`. No backend call is made.
    pub fn generate_bucket_policy(
        &self,
        bucket: &str,
        owner: &str,
        shares: &[String],
    ) -> Result<String> {
        validate_bucket_name(bucket)?;
        let mut policy = BucketPolicy::new(bucket, owner);
        for user in shares {
            policy.add_share(user.as_str());
        }
        policy.to_json()
    }

    /// Attach a policy to its bucket
    pub async fn put_bucket_policy(
        &self,
        ctx: &Context,
        user: &str,
        policy: &BucketPolicy,
    ) -> Result<()> {
        let bucket = policy.bucket();
        validate_bucket_name(bucket)?;
        let document = policy.to_json()?;
        self.sink.debug(&format!("put_bucket_policy {bucket} for {user}"));
        self.call(ctx, "put_bucket_policy", bucket, || {
            self.backend.put_bucket_policy(bucket, &document)
        })
        .await
    }

    /// Current policy document of a bucket
    pub async fn get_bucket_policy(&self, ctx: &Context, bucket: &str) -> Result<String> {
        validate_bucket_name(bucket)?;
        self.call(ctx, "get_bucket_policy", bucket, || {
            self.backend.get_bucket_policy(bucket)
        })
        .await
    }

    /// Remove the policy of a bucket
    pub async fn delete_bucket_policy(&self, ctx: &Context, user: &str, bucket: &str) -> Result<()> {
        validate_bucket_name(bucket)?;
        self.sink.debug(&format!("delete_bucket_policy {bucket} for {user}"));
        self.call(ctx, "delete_bucket_policy", bucket, || {
            self.backend.delete_bucket_policy(bucket)
        })
        .await
    }
}

async fn read_declared(backend: &dyn ObjectBackend, object: &ObjectPath) -> Result<Bytes> {
    let info = backend.head_object(&object.bucket, &object.key).await?;
    let declared = info.size_bytes.unwrap_or(0);
    let capacity = usize::try_from(declared)
        .map_err(|_| Error::Fatal(format!("{object} is too large to buffer")))?;

    let output = backend.get_object(&object.bucket, &object.key, 0).await?;
    let mut buf = Vec::with_capacity(capacity);
    output
        .body
        .take(declared + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(Error::from_body_io)?;

    if buf.len() as u64 != declared {
        return Err(Error::Fatal(format!(
            "{object}: declared {declared} bytes, read {}",
            buf.len()
        )));
    }
    Ok(Bytes::from(buf))
}

fn rewrite_origin(signed: &str, external: &Url) -> Result<String> {
    let mut url = Url::parse(signed)?;
    let rejected = |what: &str| Error::Config(format!("cannot apply external url {external}: {what}"));
    url.set_scheme(external.scheme())
        .map_err(|_| rejected("scheme"))?;
    url.set_host(external.host_str())
        .map_err(|_| rejected("host"))?;
    url.set_port(external.port())
        .map_err(|_| rejected("port"))?;
    Ok(url.to_string())
}
