//! Inode tree over a flat key namespace
//!
//! Keys are split on `/` into a tree of [`TreeNode`]s. Every directory guards
//! its own child map, so work on sibling directories never contends. The
//! tree starts empty and is filled either all at once ([`Tree::build`],
//! [`TreeBuilder::load_all`]) or one directory level at a time
//! ([`TreeBuilder::expand`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jiff::Timestamp;

use crate::client::Client;
use crate::config::MountConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::path::{clean_key, components, DELIMITER};
use crate::traits::ObjectInfo;

/// Block size reported to the kernel
pub const BLOCK_SIZE: u32 = 512;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes reported for a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: Option<Timestamp>,
    /// Permission bits, without the file type
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub blksize: u32,
    pub blocks: u64,
}

/// Resolve a child by name
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<TreeNode>;
}

/// Report attributes
pub trait GetAttr {
    fn attr(&self, mount: &MountConfig) -> NodeAttr;
}

/// A node in the tree
#[derive(Debug, Clone)]
pub enum TreeNode {
    Directory(Arc<DirNode>),
    File(Arc<FileNode>),
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::Directory(d) => &d.name,
            TreeNode::File(f) => &f.name,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            TreeNode::Directory(_) => NodeKind::Directory,
            TreeNode::File(_) => NodeKind::File,
        }
    }

    pub fn as_dir(&self) -> Option<&Arc<DirNode>> {
        match self {
            TreeNode::Directory(d) => Some(d),
            TreeNode::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileNode>> {
        match self {
            TreeNode::File(f) => Some(f),
            TreeNode::Directory(_) => None,
        }
    }
}

impl GetAttr for TreeNode {
    fn attr(&self, mount: &MountConfig) -> NodeAttr {
        match self {
            TreeNode::Directory(d) => d.attr(mount),
            TreeNode::File(f) => f.attr(mount),
        }
    }
}

#[derive(Debug, Default)]
struct Children {
    order: Vec<String>,
    nodes: HashMap<String, TreeNode>,
}

/// Directory node
#[derive(Debug)]
pub struct DirNode {
    name: String,
    path: String,
    loaded: AtomicBool,
    children: RwLock<Children>,
}

impl DirNode {
    fn new(name: &str, path: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            loaded: AtomicBool::new(false),
            children: RwLock::new(Children::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path from the bucket root, without leading or trailing delimiter
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this level has been listed
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Children in insertion order
    pub fn children(&self) -> Vec<(String, TreeNode)> {
        let children = self.read();
        children
            .order
            .iter()
            .filter_map(|name| children.nodes.get(name).map(|n| (name.clone(), n.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Children> {
        self.children.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Children> {
        self.children.write().unwrap_or_else(|e| e.into_inner())
    }

    fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}{DELIMITER}{name}", self.path)
        }
    }

    /// Existing sub-directory `name`, or a new one
    fn dir_entry(&self, name: &str) -> Result<Arc<DirNode>> {
        if let Some(node) = self.lookup(name) {
            return match node {
                TreeNode::Directory(d) => Ok(d),
                TreeNode::File(_) => Err(self.conflict(name)),
            };
        }

        let mut children = self.write();
        match children.nodes.get(name) {
            Some(TreeNode::Directory(d)) => Ok(Arc::clone(d)),
            Some(TreeNode::File(_)) => Err(self.conflict(name)),
            None => {
                let dir = Arc::new(DirNode::new(name, self.child_path(name)));
                children.order.push(name.to_string());
                children
                    .nodes
                    .insert(name.to_string(), TreeNode::Directory(Arc::clone(&dir)));
                Ok(dir)
            }
        }
    }

    /// Insert file `name`, or refresh it when already present
    fn file_entry(&self, name: &str, entry: &ObjectInfo) -> Result<Arc<FileNode>> {
        let meta = FileMeta::from(entry);
        let mut children = self.write();
        match children.nodes.get(name) {
            Some(TreeNode::File(f)) => {
                f.update(meta);
                Ok(Arc::clone(f))
            }
            Some(TreeNode::Directory(_)) => Err(self.conflict(name)),
            None => {
                let file = Arc::new(FileNode {
                    name: name.to_string(),
                    key: entry.key.clone(),
                    meta: RwLock::new(meta),
                });
                children.order.push(name.to_string());
                children
                    .nodes
                    .insert(name.to_string(), TreeNode::File(Arc::clone(&file)));
                Ok(file)
            }
        }
    }

    fn conflict(&self, name: &str) -> Error {
        Error::Fatal(format!(
            "{} is needed both as a file and a directory",
            self.child_path(name)
        ))
    }
}

impl Lookup for DirNode {
    fn lookup(&self, name: &str) -> Option<TreeNode> {
        self.read().nodes.get(name).cloned()
    }
}

impl GetAttr for DirNode {
    fn attr(&self, mount: &MountConfig) -> NodeAttr {
        NodeAttr {
            kind: NodeKind::Directory,
            size: 0,
            mtime: None,
            perm: mount.dir_mode & 0o7777,
            uid: mount.uid,
            gid: mount.gid,
            nlink: 2,
            blksize: BLOCK_SIZE,
            blocks: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileMeta {
    size: u64,
    modified: Option<Timestamp>,
}

impl From<&ObjectInfo> for FileMeta {
    fn from(info: &ObjectInfo) -> Self {
        Self {
            size: info.size_bytes.unwrap_or(0),
            modified: info.last_modified,
        }
    }
}

/// File node backed by one object
#[derive(Debug)]
pub struct FileNode {
    name: String,
    key: String,
    meta: RwLock<FileMeta>,
}

impl FileNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the backing object
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.meta().size
    }

    pub fn modified(&self) -> Option<Timestamp> {
        self.meta().modified
    }

    fn meta(&self) -> FileMeta {
        *self.meta.read().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, meta: FileMeta) {
        *self.meta.write().unwrap_or_else(|e| e.into_inner()) = meta;
    }
}

impl GetAttr for FileNode {
    fn attr(&self, mount: &MountConfig) -> NodeAttr {
        let meta = self.meta();
        NodeAttr {
            kind: NodeKind::File,
            size: meta.size,
            mtime: meta.modified,
            perm: mount.file_mode & 0o7777,
            uid: mount.uid,
            gid: mount.gid,
            nlink: 1,
            blksize: BLOCK_SIZE,
            blocks: meta.size.div_ceil(u64::from(BLOCK_SIZE)),
        }
    }
}

/// Hierarchical view of one bucket
#[derive(Debug)]
pub struct Tree {
    bucket: String,
    root: Arc<DirNode>,
}

impl Tree {
    /// Empty tree
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            root: Arc::new(DirNode::new("", String::new())),
        }
    }

    /// Build a complete tree from a recursive listing
    pub fn build(
        bucket: impl Into<String>,
        entries: impl IntoIterator<Item = ObjectInfo>,
    ) -> Result<Self> {
        let tree = Self::new(bucket);
        tree.extend(entries)?;
        Ok(tree)
    }

    /// Attach every entry and mark all directories loaded.
    ///
    /// Returns the keys that were skipped because no cleaned path reaches
    /// them.
    pub fn extend(&self, entries: impl IntoIterator<Item = ObjectInfo>) -> Result<Vec<String>> {
        let mut skipped = Vec::new();
        for entry in entries {
            if !is_addressable(&entry) {
                skipped.push(entry.key);
                continue;
            }
            self.attach(&entry)?;
        }
        mark_loaded_recursive(&self.root);
        Ok(skipped)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn root(&self) -> &Arc<DirNode> {
        &self.root
    }

    /// Attach a single listing entry.
    ///
    /// Intermediate directories are created as needed. Keys ending in the
    /// delimiter, and entries flagged as directories, only create
    /// directories.
    ///
    /// A key with `.` or `..` components, or a file key with empty
    /// components, is rejected with [`Error::Validation`]: its node could not
    /// be opened again through the cleaned path.
    pub fn attach(&self, entry: &ObjectInfo) -> Result<TreeNode> {
        if !is_addressable(entry) {
            return Err(Error::Validation(format!(
                "{}{DELIMITER}{} is not reachable through a cleaned path",
                self.bucket, entry.key
            )));
        }
        let is_dir = entry.is_dir || entry.key.ends_with(DELIMITER);
        let parts: Vec<&str> = components(&entry.key).collect();
        let Some((last, parents)) = parts.split_last() else {
            return Ok(TreeNode::Directory(Arc::clone(&self.root)));
        };

        let mut dir = Arc::clone(&self.root);
        for name in parents {
            dir = dir.dir_entry(name)?;
        }

        if is_dir {
            Ok(TreeNode::Directory(dir.dir_entry(last)?))
        } else {
            Ok(TreeNode::File(dir.file_entry(last, entry)?))
        }
    }

    /// Node at `path`, from what is already in the tree
    pub fn lookup(&self, path: &str) -> Result<TreeNode> {
        let mut node = TreeNode::Directory(Arc::clone(&self.root));
        for name in components(path) {
            node = match &node {
                TreeNode::Directory(dir) => dir.lookup(name),
                TreeNode::File(_) => None,
            }
            .ok_or_else(|| Error::NotFound(format!("{}{DELIMITER}{path}", self.bucket)))?;
        }
        Ok(node)
    }

    /// Ordered children of the directory at `path`
    pub fn children(&self, path: &str) -> Result<Vec<(String, TreeNode)>> {
        match self.lookup(path)? {
            TreeNode::Directory(dir) => Ok(dir.children()),
            TreeNode::File(_) => Err(Error::Validation(format!("{path} is not a directory"))),
        }
    }
}

/// Whether the node built from `entry` maps back to the same key.
///
/// Directory markers only need clean components; files must match their
/// cleaned key exactly since the key is what gets opened.
fn is_addressable(entry: &ObjectInfo) -> bool {
    let is_dir = entry.is_dir || entry.key.ends_with(DELIMITER);
    if is_dir {
        components(&entry.key).all(|c| c != "." && c != "..")
    } else {
        clean_key(&entry.key) == entry.key
    }
}

fn mark_loaded_recursive(dir: &Arc<DirNode>) {
    dir.mark_loaded();
    for (_, child) in dir.children() {
        if let TreeNode::Directory(sub) = child {
            mark_loaded_recursive(&sub);
        }
    }
}

/// Fills a [`Tree`] from the object store
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    client: Client,
    tree: Arc<Tree>,
}

impl TreeBuilder {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            tree: Arc::new(Tree::new(bucket)),
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// List one directory level and attach what it contains.
    ///
    /// Files and sub-directories of that level are added; deeper levels stay
    /// unloaded. An empty listing leaves a valid empty directory.
    pub async fn expand(&self, ctx: &Context, dir_path: &str) -> Result<Arc<DirNode>> {
        let dir = match self.tree.lookup(dir_path)? {
            TreeNode::Directory(dir) => dir,
            TreeNode::File(_) => {
                return Err(Error::Validation(format!("{dir_path} is not a directory")));
            }
        };
        self.expand_dir(ctx, &dir).await?;
        Ok(dir)
    }

    async fn expand_dir(&self, ctx: &Context, dir: &Arc<DirNode>) -> Result<()> {
        let entries = self
            .client
            .list_all(ctx, self.tree.bucket(), dir.path(), false)
            .await?;
        for entry in &entries {
            if is_addressable(entry) {
                self.tree.attach(entry)?;
            } else {
                self.warn_skipped(&entry.key);
            }
        }
        dir.mark_loaded();
        self.client.sink().debug(&format!(
            "expanded {}/{} with {} entries",
            self.tree.bucket(),
            dir.path(),
            entries.len()
        ));
        Ok(())
    }

    /// List the whole bucket and attach every key
    pub async fn load_all(&self, ctx: &Context) -> Result<()> {
        let entries = self
            .client
            .list_all(ctx, self.tree.bucket(), "", true)
            .await?;
        for key in self.tree.extend(entries)? {
            self.warn_skipped(&key);
        }
        Ok(())
    }

    fn warn_skipped(&self, key: &str) {
        self.client.sink().warn(&format!(
            "skipping {}/{key}: not reachable through a cleaned path",
            self.tree.bucket()
        ));
    }

    /// Resolve `path`, expanding unloaded directories along the way
    pub async fn resolve(&self, ctx: &Context, path: &str) -> Result<TreeNode> {
        let mut node = TreeNode::Directory(Arc::clone(self.tree.root()));
        for name in components(path) {
            let dir = match &node {
                TreeNode::Directory(dir) => Arc::clone(dir),
                TreeNode::File(_) => {
                    return Err(Error::NotFound(format!("{}/{path}", self.tree.bucket())));
                }
            };
            if !dir.is_loaded() {
                self.expand_dir(ctx, &dir).await?;
            }
            node = dir
                .lookup(name)
                .ok_or_else(|| Error::NotFound(format!("{}/{path}", self.tree.bucket())))?;
        }
        Ok(node)
    }

    /// Ordered children of the directory at `path`, listing it first if
    /// needed
    pub async fn children(&self, ctx: &Context, path: &str) -> Result<Vec<(String, TreeNode)>> {
        match self.resolve(ctx, path).await? {
            TreeNode::Directory(dir) => {
                if !dir.is_loaded() {
                    self.expand_dir(ctx, &dir).await?;
                }
                Ok(dir.children())
            }
            TreeNode::File(_) => Err(Error::Validation(format!("{path} is not a directory"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::Config;
    use crate::memory::MemoryBackend;
    use crate::sink::testing::RecordingSink;
    use crate::traits::ObjectBackend;

    fn names(children: &[(String, TreeNode)]) -> Vec<&str> {
        children.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_build_nested_layout() {
        let tree = Tree::build(
            "data",
            [
                ObjectInfo::file("a/b/c.txt", 3),
                ObjectInfo::file("a/b/d.txt", 4),
                ObjectInfo::file("a/e.txt", 5),
            ],
        )
        .unwrap();

        let root = tree.children("").unwrap();
        assert_eq!(names(&root), vec!["a"]);

        let a = tree.children("a").unwrap();
        assert_eq!(names(&a), vec!["b", "e.txt"]);
        assert_eq!(a[0].1.kind(), NodeKind::Directory);
        assert_eq!(a[1].1.kind(), NodeKind::File);

        let b = tree.children("a/b").unwrap();
        assert_eq!(names(&b), vec!["c.txt", "d.txt"]);

        let file = tree.lookup("a/b/d.txt").unwrap();
        assert_eq!(file.as_file().unwrap().key(), "a/b/d.txt");
        assert_eq!(file.as_file().unwrap().size(), 4);
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let tree = Tree::build(
            "data",
            [
                ObjectInfo::file("z", 1),
                ObjectInfo::file("a", 1),
                ObjectInfo::file("m", 1),
            ],
        )
        .unwrap();
        assert_eq!(names(&tree.children("").unwrap()), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_file_dir_conflict_is_fatal() {
        let tree = Tree::new("data");
        tree.attach(&ObjectInfo::file("a", 1)).unwrap();
        let result = tree.attach(&ObjectInfo::file("a/b", 1));
        assert!(matches!(result, Err(Error::Fatal(_))));

        let tree = Tree::new("data");
        tree.attach(&ObjectInfo::file("a/b", 1)).unwrap();
        let result = tree.attach(&ObjectInfo::file("a", 1));
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[test]
    fn test_reattach_updates_in_place() {
        let tree = Tree::new("data");
        let first = tree.attach(&ObjectInfo::file("f", 1)).unwrap();
        let ts = Timestamp::from_second(1_700_000_000).unwrap();
        tree.attach(&ObjectInfo::file("f", 99).modified(ts)).unwrap();

        let file = first.as_file().unwrap();
        assert_eq!(file.size(), 99);
        assert_eq!(file.modified(), Some(ts));
        assert_eq!(tree.root().len(), 1);
    }

    #[test]
    fn test_marker_keys_and_empty_components() {
        let tree = Tree::new("data");
        tree.attach(&ObjectInfo::file("empty/", 0)).unwrap();
        tree.attach(&ObjectInfo::file("/x//y/", 0)).unwrap();
        tree.attach(&ObjectInfo::file("x/z.txt", 2)).unwrap();

        assert_eq!(tree.lookup("empty").unwrap().kind(), NodeKind::Directory);
        assert!(tree.children("empty").unwrap().is_empty());
        assert_eq!(names(&tree.children("x").unwrap()), vec!["y", "z.txt"]);
        assert_eq!(tree.lookup("x/y").unwrap().as_dir().unwrap().path(), "x/y");
    }

    #[test]
    fn test_uncleaned_keys_are_rejected() {
        let tree = Tree::new("data");
        for key in ["x//z.txt", "a/./b", "a/../b", "/lead", "d/../"] {
            let result = tree.attach(&ObjectInfo::file(key, 1));
            assert!(matches!(result, Err(Error::Validation(_))), "{key}");
        }
        assert!(tree.root().is_empty());

        let skipped = tree
            .extend([ObjectInfo::file("ok.txt", 1), ObjectInfo::file("a/./b", 1)])
            .unwrap();
        assert_eq!(skipped, vec!["a/./b"]);
        assert_eq!(names(&tree.children("").unwrap()), vec!["ok.txt"]);
    }

    #[test]
    fn test_lookup_missing() {
        let tree = Tree::build("data", [ObjectInfo::file("a/b", 1)]).unwrap();
        assert!(matches!(tree.lookup("a/c"), Err(Error::NotFound(_))));
        assert!(matches!(tree.lookup("a/b/c"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_attributes() {
        let mount = MountConfig {
            uid: 1000,
            gid: 100,
            dir_mode: 0o40750,
            file_mode: 0o640,
        };
        let tree = Tree::build("data", [ObjectInfo::file("d/f", 1025)]).unwrap();

        let dir = tree.lookup("d").unwrap().attr(&mount);
        assert_eq!(dir.nlink, 2);
        assert_eq!(dir.perm, 0o750);
        assert_eq!(dir.uid, 1000);

        let file = tree.lookup("d/f").unwrap().attr(&mount);
        assert_eq!(file.nlink, 1);
        assert_eq!(file.blksize, 512);
        assert_eq!(file.blocks, 3);
        assert_eq!(file.gid, 100);
    }

    async fn seeded_builder(keys: &[&str]) -> TreeBuilder {
        let client = Client::new(Arc::new(MemoryBackend::new()), &Config::default()).unwrap();
        let ctx = Context::new();
        client.create_bucket(&ctx, "u", "data").await.unwrap();
        for key in keys {
            client
                .put_object(&ctx, "u", "data", key, Bytes::from_static(b"abc"))
                .await
                .unwrap();
        }
        TreeBuilder::new(client, "data")
    }

    #[tokio::test]
    async fn test_expand_loads_one_level() {
        let builder = seeded_builder(&["a/b/c.txt", "a/b/d.txt", "a/e.txt", "top.txt"]).await;
        let ctx = Context::new();

        let root = builder.expand(&ctx, "").await.unwrap();
        assert!(root.is_loaded());
        assert_eq!(names(&root.children()), vec!["a", "top.txt"]);

        let a = builder.tree().lookup("a").unwrap();
        assert!(!a.as_dir().unwrap().is_loaded());
        assert!(a.as_dir().unwrap().is_empty());

        let a = builder.expand(&ctx, "a").await.unwrap();
        assert_eq!(names(&a.children()), vec!["b", "e.txt"]);
        assert!(matches!(builder.tree().lookup("a/b/c.txt"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolve_expands_lazily() {
        let builder = seeded_builder(&["a/b/c.txt"]).await;
        let node = builder.resolve(&Context::new(), "a/b/c.txt").await.unwrap();
        assert_eq!(node.as_file().unwrap().size(), 3);

        let missing = builder.resolve(&Context::new(), "a/nope").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_all_matches_build() {
        let builder = seeded_builder(&["a/b/c.txt", "a/b/d.txt", "a/e.txt"]).await;
        builder.load_all(&Context::new()).await.unwrap();

        let tree = builder.tree();
        assert!(tree.lookup("a/b").unwrap().as_dir().unwrap().is_loaded());
        assert_eq!(names(&tree.children("a/b").unwrap()), vec!["c.txt", "d.txt"]);
    }

    #[tokio::test]
    async fn test_expand_skips_uncleaned_keys_with_warning() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create_bucket("data").await.unwrap();
        for key in ["good.txt", "x//z.txt", "y/./w"] {
            backend
                .put_object("data", key, Bytes::from_static(b"abc"))
                .await
                .unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let client = Client::new(backend, &Config::default())
            .unwrap()
            .with_sink(sink.clone());
        let builder = TreeBuilder::new(client, "data");

        builder.load_all(&Context::new()).await.unwrap();
        assert_eq!(names(&builder.tree().children("").unwrap()), vec!["good.txt"]);

        let warnings = sink.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("x//z.txt")));
        assert!(warnings.iter().any(|w| w.contains("y/./w")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sibling_expansion() {
        let mut keys = Vec::new();
        for dir in ["a", "b"] {
            for i in 0..50 {
                keys.push(format!("{dir}/f{i:02}"));
            }
        }
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let builder = seeded_builder(&keys).await;
        let ctx = Context::new();
        builder.expand(&ctx, "").await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for dir in ["a", "b", "a", "b"] {
            let builder = builder.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move { builder.expand(&ctx, dir).await.map(|_| ()) });
        }
        while let Some(done) = tasks.join_next().await {
            done.unwrap().unwrap();
        }

        let expected: Vec<String> = (0..50).map(|i| format!("f{i:02}")).collect();
        for dir in ["a", "b"] {
            let children = builder.tree().children(dir).unwrap();
            assert_eq!(names(&children), expected, "{dir}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attach_under_many_parents() {
        let tree = Arc::new(Tree::new("data"));
        let mut tasks = tokio::task::JoinSet::new();
        for task in 0..16 {
            let tree = Arc::clone(&tree);
            tasks.spawn(async move {
                for i in 0..40 {
                    let parent = format!("p{}", i % 4);
                    tree.attach(&ObjectInfo::file(format!("{parent}/t{task}-{i}"), 1))
                        .unwrap();
                    tree.attach(&ObjectInfo::file(format!("{parent}/shared{}", i % 8), 1))
                        .unwrap();
                }
            });
        }
        while let Some(done) = tasks.join_next().await {
            done.unwrap();
        }

        let mut roots = names(&tree.children("").unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        roots.sort();
        assert_eq!(roots, vec!["p0", "p1", "p2", "p3"]);

        for p in 0..4 {
            let children = tree.children(&format!("p{p}")).unwrap();
            let mut seen: Vec<&str> = names(&children);
            let total = seen.len();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), total, "duplicate child under p{p}");
            // 16 tasks x 10 own files, plus the two shared names for this parent
            assert_eq!(total, 16 * 10 + 2, "p{p}");
        }
    }

    #[tokio::test]
    async fn test_expand_empty_bucket() {
        let builder = seeded_builder(&[]).await;
        let root = builder.expand(&Context::new(), "").await.unwrap();
        assert!(root.is_loaded());
        assert!(root.is_empty());
    }
}
