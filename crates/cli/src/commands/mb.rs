//! mb command - Make bucket
//!
//! Creates a new bucket on the configured storage service.

use bfs_core::Error;
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Create a bucket
#[derive(Args, Debug)]
pub struct MbArgs {
    /// Bucket name
    pub bucket: String,

    /// Ignore error if bucket already exists
    #[arg(short = 'p', long)]
    pub ignore_existing: bool,
}

#[derive(Debug, Serialize)]
struct MbOutput {
    status: &'static str,
    bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Execute the mb command
pub async fn execute(args: MbArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let bucket = args.bucket.trim_end_matches('/');

    match session
        .client
        .create_bucket(&session.ctx, &session.user, bucket)
        .await
    {
        Ok(created) => {
            if formatter.is_json() {
                formatter.json(&MbOutput {
                    status: "success",
                    bucket: created.name,
                    message: None,
                });
            } else {
                formatter.success(&format!("Bucket '{bucket}' created successfully."));
            }
            ExitCode::Success
        }
        Err(Error::AlreadyExists(_)) if args.ignore_existing => {
            if formatter.is_json() {
                formatter.json(&MbOutput {
                    status: "success",
                    bucket: bucket.to_string(),
                    message: Some("Bucket already exists".to_string()),
                });
            } else {
                formatter.success(&format!("Bucket '{bucket}' already exists."));
            }
            ExitCode::Success
        }
        Err(e) => fail(formatter, "Failed to create bucket", &e),
    }
}
