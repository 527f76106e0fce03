//! rm command - Remove objects

use bfs_core::{Error, parse_path};
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Remove objects
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Object paths (bucket/key)
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Ignore objects that do not exist
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct RmOutput {
    status: &'static str,
    deleted: Vec<String>,
}

/// Execute the rm command
pub async fn execute(args: RmArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let mut targets = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        match parse_path(path) {
            Ok(target) if !target.is_root() => targets.push(target),
            Ok(_) => {
                formatter.error(&format!("Object key is required: '{path}'"));
                return ExitCode::UsageError;
            }
            Err(e) => return fail(formatter, "Invalid path", &e),
        }
    }

    let mut deleted = Vec::new();
    for target in targets {
        match session
            .client
            .delete_object(&session.ctx, &session.user, &target.bucket, &target.key)
            .await
        {
            Ok(()) => {
                formatter.success(&format!("Removed {target}"));
                deleted.push(target.to_string());
            }
            Err(Error::NotFound(_)) if args.force => {
                formatter.warning(&format!("{target} does not exist"));
            }
            Err(e) => return fail(formatter, &format!("Failed to remove {target}"), &e),
        }
    }

    if formatter.is_json() {
        formatter.json(&RmOutput {
            status: "success",
            deleted,
        });
    }
    ExitCode::Success
}
