//! bfs-s3: S3 backend for bucketfs
//!
//! This crate provides the implementation of the ObjectBackend trait
//! using the aws-sdk-s3 crate. It is the only crate that directly
//! depends on the AWS SDK.

pub mod client;
pub mod multipart;

pub use client::S3Backend;
pub use multipart::MultipartConfig;
