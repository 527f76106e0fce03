//! bfs-core: Core library for bucketfs
//!
//! This crate provides everything that does not depend on a particular
//! object-store SDK:
//! - Configuration management
//! - The error taxonomy shared by all layers
//! - A retrying object-store [`Client`] over the [`ObjectBackend`] trait
//! - The lazily built inode [`Tree`]
//! - The per-open-file data [`pipeline`]
//! - The [`BucketFs`] facade handed to a kernel-protocol adapter
//!
//! Backends live in other crates; [`MemoryBackend`] is included for tests
//! and embedding.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod memory;
pub mod path;
pub mod pipeline;
pub mod policy;
pub mod retry;
pub mod sink;
pub mod traits;
pub mod tree;

pub use client::Client;
pub use config::{Config, ConfigManager};
pub use context::Context;
pub use error::{Error, Result};
pub use fs::{BucketFs, HandleId};
pub use memory::MemoryBackend;
pub use path::{ObjectPath, parse_path};
pub use pipeline::{ByteLimit, FileHandle, OpenMode, OpenOptions, TransferStats};
pub use policy::BucketPolicy;
pub use retry::{Backoff, Retrier};
pub use sink::{LogSink, TracingSink};
pub use traits::{
    Bucket, ByteStream, GetObjectOutput, ListOptions, ListResult, ObjectBackend, ObjectInfo,
};
pub use tree::{NodeAttr, NodeKind, Tree, TreeBuilder, TreeNode};
