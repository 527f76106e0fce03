//! Filesystem facade
//!
//! [`BucketFs`] is what a kernel-protocol adapter talks to: path lookups,
//! directory listings and attributes come from the lazily built tree, and
//! open files are tracked by opaque numeric handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};

use crate::client::Client;
use crate::config::MountConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::path::clean_key;
use crate::pipeline::{FileHandle, Open, OpenMode};
use crate::traits::ObjectInfo;
use crate::tree::{GetAttr, NodeAttr, TreeBuilder, TreeNode};

/// Opaque handle id
pub type HandleId = u64;

struct OpenFile {
    handle: Arc<FileHandle>,
    path: String,
}

#[derive(Default)]
struct HandleTable {
    next: HandleId,
    open: HashMap<HandleId, OpenFile>,
}

/// One bucket presented as a filesystem
pub struct BucketFs {
    builder: TreeBuilder,
    user: String,
    mount: MountConfig,
    handles: Mutex<HandleTable>,
}

impl std::fmt::Debug for BucketFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketFs")
            .field("bucket", &self.bucket())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl BucketFs {
    pub fn new(client: Client, bucket: &str, user: &str, mount: MountConfig) -> Self {
        Self {
            builder: TreeBuilder::new(client, bucket),
            user: user.to_string(),
            mount,
            handles: Mutex::new(HandleTable::default()),
        }
    }

    pub fn bucket(&self) -> &str {
        self.builder.tree().bucket()
    }

    pub fn builder(&self) -> &TreeBuilder {
        &self.builder
    }

    fn table(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, fh: HandleId) -> Result<Arc<FileHandle>> {
        self.table()
            .open
            .get(&fh)
            .map(|f| Arc::clone(&f.handle))
            .ok_or_else(|| Error::NotFound(format!("file handle {fh}")))
    }

    /// Node at `path`
    pub async fn lookup(&self, ctx: &Context, path: &str) -> Result<TreeNode> {
        self.builder.resolve(ctx, path).await
    }

    /// Ordered entries of the directory at `path`
    pub async fn children(&self, ctx: &Context, path: &str) -> Result<Vec<(String, TreeNode)>> {
        self.builder.children(ctx, path).await
    }

    pub async fn getattr(&self, ctx: &Context, path: &str) -> Result<NodeAttr> {
        Ok(self.lookup(ctx, path).await?.attr(&self.mount))
    }

    /// Open `path` and register the handle.
    ///
    /// Read mode requires an existing file. Write mode creates or replaces
    /// the object; it becomes visible in the tree on release.
    pub async fn open(&self, ctx: &Context, path: &str, mode: OpenMode) -> Result<HandleId> {
        let key = clean_key(path);
        let handle = match mode {
            OpenMode::Read => match self.lookup(ctx, &key).await? {
                TreeNode::File(file) => file.open(ctx, self.builder.client(), self.bucket()).await?,
                TreeNode::Directory(_) => {
                    return Err(Error::Validation(format!("{key} is a directory")));
                }
            },
            OpenMode::Write => {
                if let Ok(TreeNode::Directory(_)) = self.lookup(ctx, &key).await {
                    return Err(Error::Validation(format!("{key} is a directory")));
                }
                FileHandle::create(
                    ctx,
                    self.builder.client().clone(),
                    &self.user,
                    self.bucket(),
                    &key,
                    None,
                )
            }
        };

        let mut table = self.table();
        table.next += 1;
        let fh = table.next;
        table.open.insert(
            fh,
            OpenFile {
                handle: Arc::new(handle),
                path: key,
            },
        );
        Ok(fh)
    }

    /// Read up to `len` bytes at `offset`. A short result means end of file.
    pub async fn read(&self, fh: HandleId, offset: u64, len: usize) -> Result<Bytes> {
        let handle = self.handle(fh)?;
        let mut out = BytesMut::zeroed(len);
        let filled = handle.read_at(offset, &mut out).await?;
        out.truncate(filled);
        Ok(out.freeze())
    }

    /// Write `data` at `offset`. Writes must continue where the previous
    /// one ended.
    pub async fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        self.handle(fh)?.write_at(offset, data).await
    }

    /// Close and forget a handle. Files written through it are attached to
    /// the tree once the upload succeeds.
    pub async fn release(&self, fh: HandleId) -> Result<()> {
        let file = self
            .table()
            .open
            .remove(&fh)
            .ok_or_else(|| Error::NotFound(format!("file handle {fh}")))?;

        let closed = file.handle.close().await;
        file.handle.done().await;
        closed?;

        if file.handle.mode() == OpenMode::Write {
            let info = file
                .handle
                .uploaded()
                .await
                .unwrap_or_else(|| ObjectInfo::file(file.path.as_str(), 0));
            let entry = ObjectInfo {
                key: file.path.clone(),
                ..info
            };
            self.builder.tree().attach(&entry)?;
        }
        Ok(())
    }

    /// Number of open handles
    pub fn open_handles(&self) -> usize {
        self.table().open.len()
    }
}
