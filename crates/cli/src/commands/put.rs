//! put command - Upload a file or stdin to an object
//!
//! The source is streamed; large inputs become multipart uploads without
//! being held in memory.

use std::path::PathBuf;

use bfs_core::{ByteStream, ObjectInfo, parse_path};
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Upload a file or stdin to an object
#[derive(Args, Debug)]
pub struct PutArgs {
    /// Destination path (bucket/key)
    pub target: String,

    /// Source file (reads stdin when omitted or "-")
    pub source: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PutOutput {
    status: &'static str,
    target: String,
    size_bytes: u64,
    size_human: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

impl PutOutput {
    fn new(target: String, info: ObjectInfo) -> Self {
        let size = info.size_bytes.unwrap_or(0);
        Self {
            status: "success",
            target,
            size_bytes: size,
            size_human: humansize::format_size(size, humansize::BINARY),
            etag: info.etag,
        }
    }
}

/// Execute the put command
pub async fn execute(args: PutArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let target = match parse_path(&args.target) {
        Ok(target) if !target.is_root() => target,
        Ok(_) => {
            formatter.error("Object key is required for put command.");
            return ExitCode::UsageError;
        }
        Err(e) => return fail(formatter, "Invalid path", &e),
    };

    let source: ByteStream = match &args.source {
        Some(path) if path.as_os_str() != "-" => match tokio::fs::File::open(path).await {
            Ok(file) => Box::pin(file),
            Err(e) => {
                formatter.error(&format!("Failed to open {}: {e}", path.display()));
                return ExitCode::UsageError;
            }
        },
        _ => Box::pin(tokio::io::stdin()),
    };

    match session
        .client
        .upload_object(&session.ctx, &session.user, &target.bucket, &target.key, source)
        .await
    {
        Ok(info) => {
            let output = PutOutput::new(target.to_string(), info);
            if formatter.is_json() {
                formatter.json(&output);
            } else {
                formatter.success(&format!(
                    "Uploaded to {} ({})",
                    output.target, output.size_human
                ));
            }
            ExitCode::Success
        }
        Err(e) => fail(formatter, &format!("Failed to upload {target}"), &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_output_from_info() {
        let mut info = ObjectInfo::file("a.bin", 2048);
        info.etag = Some("abc".into());
        let output = PutOutput::new("data/a.bin".into(), info);
        assert_eq!(output.size_bytes, 2048);
        assert_eq!(output.size_human, "2 KiB");
        assert_eq!(output.etag.as_deref(), Some("abc"));
    }
}
