//! Per-open-file data pipeline
//!
//! A [`FileHandle`] owns the stream of one open file. Reads go through an
//! [`AccountedStream`], which counts bytes, honours an optional shared
//! [`ByteLimit`] and observes cancellation. Large or unsized objects get a
//! read-ahead task that fills fixed-size slots ahead of the consumer. Writes
//! feed a pipe whose other end is streamed to the object store by a
//! background upload.
//!
//! Handle states: open, then any number of reads/writes/seeks, then closed.
//! Closing is terminal and idempotent.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::traits::{ByteStream, ObjectInfo};
use crate::tree::FileNode;

/// Size of one read-ahead slot
pub const SLOT_SIZE: usize = 1024 * 1024;

// ==================== Accounting ====================

/// Byte ceiling shared between handles
#[derive(Debug, Clone)]
pub struct ByteLimit {
    remaining: Arc<AtomicI64>,
}

impl ByteLimit {
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicI64::new(i64::try_from(limit).unwrap_or(i64::MAX))),
        }
    }

    pub fn remaining(&self) -> u64 {
        u64::try_from(self.remaining.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// Take up to `n` bytes from the budget, returning how many were granted
    pub fn take(&self, n: usize) -> usize {
        let want = i64::try_from(n).unwrap_or(i64::MAX);
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r - want.min(r.max(0)))
            })
            .unwrap_or_else(|r| r);
        usize::try_from(want.min(previous.max(0))).unwrap_or(0)
    }
}

/// Bytes moved through one handle
#[derive(Debug, Default)]
pub struct TransferStats {
    read: AtomicU64,
    written: AtomicU64,
}

impl TransferStats {
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn add_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Re-applies a handle's accounting to a new stream
pub type WrapFn = Arc<dyn Fn(ByteStream) -> AccountedStream + Send + Sync>;

/// Cancellation, limit and statistics shared by the streams of one handle
#[derive(Debug, Clone)]
pub struct Meter {
    ctx: Context,
    limit: Option<ByteLimit>,
    stats: Arc<TransferStats>,
}

impl Meter {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            limit: None,
            stats: Arc::new(TransferStats::default()),
        }
    }

    pub fn with_limit(mut self, limit: Option<ByteLimit>) -> Self {
        self.limit = limit;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// Wrap `stream` with this meter's accounting
    pub fn wrap(&self, stream: ByteStream) -> AccountedStream {
        AccountedStream {
            inner: stream,
            meter: self.clone(),
        }
    }

    /// Closure form of [`wrap`](Self::wrap)
    pub fn wrap_fn(&self) -> WrapFn {
        let meter = self.clone();
        Arc::new(move |stream| meter.wrap(stream))
    }

    fn grant(&self, n: usize) -> usize {
        match &self.limit {
            Some(limit) => limit.take(n),
            None => n,
        }
    }

    /// Error seen on the stream, re-tagged when the context is gone
    fn stream_error(&self, err: io::Error) -> Error {
        if self.ctx.is_cancelled() {
            Error::Cancelled
        } else {
            Error::from_io(err)
        }
    }

    /// Error seen while pulling object bytes; a broken transfer is transient
    fn body_error(&self, err: io::Error) -> Error {
        match self.stream_error(err) {
            Error::Io(e) => Error::from_body_io(e),
            other => other,
        }
    }
}

/// Stream with byte accounting
pub struct AccountedStream {
    inner: ByteStream,
    meter: Meter,
}

impl AccountedStream {
    /// Split into the raw stream and a function that re-applies the same
    /// accounting
    pub fn into_parts(self) -> (ByteStream, WrapFn) {
        let wrap = self.meter.wrap_fn();
        (self.inner, wrap)
    }
}

impl std::fmt::Debug for AccountedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountedStream")
            .field("meter", &self.meter)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for AccountedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.meter.ctx.is_cancelled() {
            return Poll::Ready(Err(Error::Cancelled.into_io()));
        }

        let before = buf.filled().len();
        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                Poll::Ready(Err(this.meter.stream_error(err).into_io()))
            }
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                let granted = this.meter.grant(read);
                if granted < read {
                    buf.set_filled(before + granted);
                }
                this.meter.stats.add_read(granted);
                Poll::Ready(Ok(()))
            }
        }
    }
}

// ==================== Read-ahead ====================

/// Whether an object of `size` bytes gets a read-ahead buffer
pub fn should_buffer(size: Option<u64>, threshold: u64) -> bool {
    size.is_none_or(|s| s > threshold)
}

/// Read-ahead slots for `remaining` bytes under a `budget`.
///
/// Unknown sizes and sizes at or above the budget use the whole budget;
/// smaller sizes get just enough slots to cover what is left.
pub fn slot_count(remaining: Option<u64>, budget: u64) -> usize {
    let slot = SLOT_SIZE as u64;
    let slots = match remaining {
        Some(size) if size < budget => size.div_ceil(slot),
        _ => budget / slot,
    };
    usize::try_from(slots).unwrap_or(usize::MAX).max(1)
}

/// Consumer side of a read-ahead buffer
pub struct ReadAheadReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
    token: CancellationToken,
    finished: bool,
}

impl AsyncRead for ReadAheadReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = buf.remaining().min(this.current.len());
                buf.put_slice(&this.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => this.current = chunk,
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    if this.token.is_cancelled() {
                        return Poll::Ready(Err(Error::Cancelled.into_io()));
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Producer side of a read-ahead buffer.
///
/// Dropping it cancels the task; [`stop`](Self::stop) also waits for it.
#[derive(Debug)]
pub struct ReadAheadTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ReadAheadTask {
    /// Cancel the task and wait until it has exited
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ReadAheadTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Start filling up to `slots` slots from `source` in the background
pub fn read_ahead(
    mut source: ByteStream,
    slots: usize,
    token: CancellationToken,
) -> (ReadAheadReader, ReadAheadTask) {
    let (tx, rx) = mpsc::channel(slots.max(1));
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        loop {
            let filled = tokio::select! {
                _ = task_token.cancelled() => return,
                filled = fill_slot(&mut source) => filled,
            };
            let (item, last) = match filled {
                Ok(chunk) if chunk.is_empty() => return,
                Ok(chunk) => {
                    let last = chunk.len() < SLOT_SIZE;
                    (Ok(chunk), last)
                }
                Err(err) => (Err(err), true),
            };
            tokio::select! {
                _ = task_token.cancelled() => return,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            if last {
                return;
            }
        }
    });

    let reader = ReadAheadReader {
        rx,
        current: Bytes::new(),
        token: token.clone(),
        finished: false,
    };
    let task = ReadAheadTask {
        token,
        handle: Some(handle),
    };
    (reader, task)
}

async fn fill_slot(source: &mut ByteStream) -> io::Result<Bytes> {
    let mut slot = vec![0u8; SLOT_SIZE];
    let mut filled = 0;
    while filled < SLOT_SIZE {
        let n = source.read(&mut slot[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    slot.truncate(filled);
    Ok(Bytes::from(slot))
}

// ==================== Handles ====================

/// Options for opening a file for reading
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Declared object size, when known
    pub size: Option<u64>,
    /// First byte to read
    pub offset: u64,
    /// Shared byte ceiling
    pub limit: Option<ByteLimit>,
}

/// Open mode of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Default)]
struct HandleState {
    reader: Option<AccountedStream>,
    writer: Option<DuplexStream>,
    upload: Option<JoinHandle<Result<ObjectInfo>>>,
    uploaded: Option<ObjectInfo>,
    read_ahead: Option<ReadAheadTask>,
    buffered: bool,
    closed: bool,
    position: u64,
}

/// One open file
pub struct FileHandle {
    client: Client,
    bucket: String,
    key: String,
    size: Option<u64>,
    mode: OpenMode,
    meter: Meter,
    state: Mutex<HandleState>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    /// Open an object for reading
    pub async fn open_read(
        ctx: &Context,
        client: Client,
        bucket: &str,
        key: &str,
        options: OpenOptions,
    ) -> Result<Self> {
        let handle = Self {
            client,
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: options.size,
            mode: OpenMode::Read,
            meter: Meter::new(ctx.child()).with_limit(options.limit),
            state: Mutex::new(HandleState::default()),
        };
        handle.seek(options.offset).await?;
        Ok(handle)
    }

    /// Open a new object for writing.
    ///
    /// The upload starts immediately and consumes what is written; it
    /// completes on [`close`](Self::close).
    pub fn create(
        ctx: &Context,
        client: Client,
        user: &str,
        bucket: &str,
        key: &str,
        limit: Option<ByteLimit>,
    ) -> Self {
        let meter = Meter::new(ctx.child()).with_limit(limit);
        let (pipe, body) = tokio::io::duplex(SLOT_SIZE);

        let upload = {
            let client = client.clone();
            let ctx = meter.ctx.clone();
            let (user, bucket, key) = (user.to_string(), bucket.to_string(), key.to_string());
            tokio::spawn(async move {
                client
                    .upload_object(&ctx, &user, &bucket, &key, Box::pin(body))
                    .await
            })
        };

        Self {
            client,
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: None,
            mode: OpenMode::Write,
            meter,
            state: Mutex::new(HandleState {
                writer: Some(pipe),
                upload: Some(upload),
                ..Default::default()
            }),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        self.meter.stats()
    }

    /// Cancel every pending and future operation on this handle
    pub fn cancel(&self) {
        self.meter.ctx.cancel();
    }

    /// Offset of the next read or write
    pub async fn position(&self) -> u64 {
        self.state.lock().await.position
    }

    /// Whether a read-ahead buffer is attached
    pub async fn is_buffered(&self) -> bool {
        self.state.lock().await.buffered
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Metadata of the stored object, once a write handle is closed
    pub async fn uploaded(&self) -> Option<ObjectInfo> {
        self.state.lock().await.uploaded.clone()
    }

    fn ensure_open(&self, state: &HandleState) -> Result<()> {
        self.meter.ctx.check()?;
        if state.closed {
            return Err(Error::Closed(format!("{}/{}", self.bucket, self.key)));
        }
        Ok(())
    }

    /// Read into `buf`, returning the number of bytes read (0 at the end)
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        self.read_locked(&mut state, buf).await
    }

    /// Fill `buf` from `offset`, reopening the object when the stream is
    /// positioned elsewhere. A short count means end of file.
    ///
    /// The position check, the reopen and the reads hold the handle lock
    /// throughout, so concurrent callers never see each other's offsets.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        if state.position != offset {
            self.ensure_seekable()?;
            let output = self
                .client
                .open_object(&self.meter.ctx, &self.bucket, &self.key, offset)
                .await?;
            self.install_stream(&mut state, output.body, offset).await;
        }

        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_locked(&mut state, &mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn read_locked(&self, state: &mut HandleState, buf: &mut [u8]) -> Result<usize> {
        let Some(reader) = state.reader.as_mut() else {
            return Err(Error::Validation(format!(
                "{}/{} is not open for reading",
                self.bucket, self.key
            )));
        };
        let read = reader.read(buf).await;
        let n = read.map_err(|e| self.meter.body_error(e))?;
        state.position += n as u64;
        Ok(n)
    }

    /// Write `data`, returning the number of bytes accepted
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        self.write_locked(&mut state, data).await
    }

    /// Write `data` at `offset`, which must be where the previous write
    /// ended
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        if state.position != offset {
            return Err(Error::Validation(format!(
                "non-sequential write to {}/{}: expected offset {}, got {offset}",
                self.bucket, self.key, state.position
            )));
        }
        self.write_locked(&mut state, data).await
    }

    async fn write_locked(&self, state: &mut HandleState, data: &[u8]) -> Result<usize> {
        let Some(writer) = state.writer.as_mut() else {
            return Err(Error::Validation(format!(
                "{}/{} is not open for writing",
                self.bucket, self.key
            )));
        };

        let granted = self.meter.grant(data.len());
        let written = writer.write_all(&data[..granted]).await;
        if let Err(err) = written {
            // The pipe breaks when the upload has already given up.
            if let Some(upload) = state.upload.take_if(|u| u.is_finished()) {
                if let Ok(Err(upload_err)) = upload.await {
                    return Err(upload_err);
                }
            }
            return Err(self.meter.stream_error(err));
        }

        self.meter.stats.add_written(granted);
        state.position += granted as u64;
        Ok(granted)
    }

    fn ensure_seekable(&self) -> Result<()> {
        if self.mode == OpenMode::Write {
            return Err(Error::Validation(format!(
                "{}/{} is open for writing and cannot seek",
                self.bucket, self.key
            )));
        }
        Ok(())
    }

    /// Reopen the object at `offset`
    pub async fn seek(&self, offset: u64) -> Result<()> {
        self.ensure_seekable()?;
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        let output = self
            .client
            .open_object(&self.meter.ctx, &self.bucket, &self.key, offset)
            .await?;
        self.install_stream(&mut state, output.body, offset).await;
        Ok(())
    }

    /// Replace the stream with `body`, positioned at `offset`.
    ///
    /// A running read-ahead task is stopped first; a new one is attached
    /// when the object qualifies for buffering.
    pub async fn update_stream(&self, body: ByteStream, offset: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        self.install_stream(&mut state, body, offset).await;
        Ok(())
    }

    async fn install_stream(&self, state: &mut HandleState, body: ByteStream, offset: u64) {
        if let Some(task) = state.read_ahead.take() {
            task.stop().await;
        }

        let transfer = self.client.transfer();
        let body = if should_buffer(self.size, transfer.buffer_threshold) {
            let remaining = self.size.map(|s| s.saturating_sub(offset));
            let slots = slot_count(remaining, transfer.buffer_size);
            let (reader, task) = read_ahead(body, slots, self.meter.ctx.token().child_token());
            state.read_ahead = Some(task);
            state.buffered = true;
            Box::pin(reader) as ByteStream
        } else {
            state.buffered = false;
            body
        };

        state.reader = Some(self.meter.wrap(body));
        state.position = offset;
    }

    /// Install an already wrapped stream
    pub async fn set_stream(&self, stream: AccountedStream) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        state.reader = Some(stream);
        Ok(())
    }

    /// Take the current stream out of the handle, together with the function
    /// that re-applies this handle's accounting
    pub async fn unwrap_stream(&self) -> Result<(ByteStream, WrapFn)> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        let stream = state.reader.take().ok_or_else(|| {
            Error::Validation(format!("{}/{} has no stream", self.bucket, self.key))
        })?;
        Ok(stream.into_parts())
    }

    /// Release the stream. A write handle finishes its upload and reports
    /// its result. Later calls return `Ok` without doing anything.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.reader = None;

        if let Some(mut writer) = state.writer.take() {
            let shutdown = writer.shutdown().await;
            drop(writer);
            if let Err(err) = shutdown {
                return Err(self.meter.stream_error(err));
            }
        }
        if let Some(upload) = state.upload.take() {
            let info = upload
                .await
                .map_err(|e| Error::Fatal(format!("upload task failed: {e}")))??;
            state.uploaded = Some(info);
        }
        Ok(())
    }

    /// Stop the read-ahead task and wait for it. Safe with or without a
    /// prior close.
    pub async fn done(&self) {
        let task = self.state.lock().await.read_ahead.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // An unclosed write handle must not commit a truncated object.
        if !self.state.get_mut().closed {
            self.meter.ctx.cancel();
        }
    }
}

// ==================== Capabilities ====================

/// Open a node's content
#[async_trait]
pub trait Open {
    async fn open(&self, ctx: &Context, client: &Client, bucket: &str) -> Result<FileHandle>;
}

/// Sequential reads
#[async_trait]
pub trait Read: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Sequential writes
#[async_trait]
pub trait Write: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<usize>;
}

#[async_trait]
impl Open for FileNode {
    async fn open(&self, ctx: &Context, client: &Client, bucket: &str) -> Result<FileHandle> {
        let options = OpenOptions {
            size: Some(self.size()),
            ..Default::default()
        };
        FileHandle::open_read(ctx, client.clone(), bucket, self.key(), options).await
    }
}

#[async_trait]
impl Read for FileHandle {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        FileHandle::read(self, buf).await
    }
}

#[async_trait]
impl Write for FileHandle {
    async fn write(&self, data: &[u8]) -> Result<usize> {
        FileHandle::write(self, data).await
    }
}
