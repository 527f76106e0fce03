//! rb command - Remove bucket
//!
//! Deletes every object in a bucket, then the bucket itself.

use bfs_core::Error;
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Remove a bucket
#[derive(Args, Debug)]
pub struct RbArgs {
    /// Bucket name
    pub bucket: String,

    /// Do not fail if the bucket does not exist
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct RbOutput {
    status: &'static str,
    bucket: String,
}

/// Execute the rb command
pub async fn execute(args: RbArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let bucket = args.bucket.trim_end_matches('/');

    match session
        .client
        .delete_bucket(&session.ctx, &session.user, bucket)
        .await
    {
        Ok(()) => {}
        Err(Error::NotFound(_)) if args.force => {}
        Err(e) => return fail(formatter, "Failed to remove bucket", &e),
    }

    if formatter.is_json() {
        formatter.json(&RbOutput {
            status: "success",
            bucket: bucket.to_string(),
        });
    } else {
        formatter.success(&format!("Bucket '{bucket}' removed."));
    }
    ExitCode::Success
}
