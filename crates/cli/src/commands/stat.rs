//! stat command - Show bucket or object metadata

use bfs_core::{Error, ObjectInfo, parse_path};
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Show bucket or object metadata
#[derive(Args, Debug)]
pub struct StatArgs {
    /// Bucket or object path (bucket[/key])
    pub path: String,
}

#[derive(Debug, Serialize)]
struct StatOutput {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

impl StatOutput {
    fn bucket(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "bucket",
            last_modified: None,
            size_bytes: None,
            size_human: None,
            etag: None,
            content_type: None,
        }
    }

    fn object(name: String, info: ObjectInfo) -> Self {
        Self {
            name,
            kind: "file",
            last_modified: info.last_modified.map(|t| t.to_string()),
            size_human: info.size_human.or_else(|| {
                info.size_bytes
                    .map(|s| humansize::format_size(s, humansize::BINARY))
            }),
            size_bytes: info.size_bytes,
            etag: info.etag,
            content_type: info.content_type,
        }
    }

    fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Name      : {}", self.name),
            format!("Type      : {}", self.kind),
        ];
        if let Some(date) = &self.last_modified {
            lines.push(format!("Date      : {date}"));
        }
        if let (Some(bytes), Some(human)) = (self.size_bytes, &self.size_human) {
            lines.push(format!("Size      : {human} ({bytes} bytes)"));
        }
        if let Some(etag) = &self.etag {
            lines.push(format!("ETag      : {etag}"));
        }
        if let Some(content_type) = &self.content_type {
            lines.push(format!("Content   : {content_type}"));
        }
        lines
    }
}

/// Execute the stat command
pub async fn execute(args: StatArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let target = match parse_path(&args.path) {
        Ok(target) => target,
        Err(e) => return fail(formatter, "Invalid path", &e),
    };

    let output = if target.is_root() {
        match session.client.head_bucket(&session.ctx, &target.bucket).await {
            Ok(true) => StatOutput::bucket(&target.bucket),
            Ok(false) => {
                let err = Error::NotFound(target.bucket.clone());
                return fail(formatter, "Failed to stat", &err);
            }
            Err(e) => return fail(formatter, "Failed to stat", &e),
        }
    } else {
        match session
            .client
            .head_object(&session.ctx, &target.bucket, &target.key)
            .await
        {
            Ok(info) => StatOutput::object(target.to_string(), info),
            Err(e) => return fail(formatter, "Failed to stat", &e),
        }
    };

    if formatter.is_json() {
        formatter.json(&output);
    } else {
        for line in output.lines() {
            formatter.println(&line);
        }
    }
    ExitCode::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_lines() {
        let mut info = ObjectInfo::file("a.txt", 1536);
        info.etag = Some("e1".into());
        let output = StatOutput::object("docs/a.txt".into(), info);
        let lines = output.lines();
        assert_eq!(lines[0], "Name      : docs/a.txt");
        assert!(lines.iter().any(|l| l.contains("(1536 bytes)")));
        assert!(lines.iter().any(|l| l == "ETag      : e1"));
    }

    #[test]
    fn test_bucket_json_omits_object_fields() {
        let json = serde_json::to_value(StatOutput::bucket("photos")).unwrap();
        assert_eq!(json["type"], "bucket");
        assert!(json.get("size_bytes").is_none());
    }
}
