//! policy command - Bucket access policies
//!
//! Renders the policy for a bucket owner, optional read-only shares and
//! per-directory grants. `--apply` attaches it; `--show` and `--remove`
//! work on whatever policy the bucket currently has.

use bfs_core::{BucketPolicy, Result};
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Generate, apply or inspect a bucket policy
#[derive(Args, Debug)]
pub struct PolicyArgs {
    /// Bucket name
    pub bucket: String,

    /// User owning the bucket
    #[arg(long, required_unless_present_any = ["show", "remove"])]
    pub owner: Option<String>,

    /// User granted read-only access to the whole bucket
    #[arg(long = "share", value_name = "USER")]
    pub shares: Vec<String>,

    /// Directory owned by a user (DIR=USER)
    #[arg(long = "dir", value_name = "DIR=USER", value_parser = parse_grant)]
    pub dirs: Vec<(String, String)>,

    /// Directory shared read-only with a user (DIR=USER)
    #[arg(long = "share-dir", value_name = "DIR=USER", value_parser = parse_grant)]
    pub share_dirs: Vec<(String, String)>,

    /// Attach the policy to the bucket
    #[arg(long, conflicts_with_all = ["show", "remove"])]
    pub apply: bool,

    /// Print the policy currently attached
    #[arg(long, conflicts_with = "remove")]
    pub show: bool,

    /// Remove the policy currently attached
    #[arg(long)]
    pub remove: bool,
}

#[derive(Debug, Serialize)]
struct PolicyOutput {
    status: &'static str,
    bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy: Option<serde_json::Value>,
}

fn parse_grant(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((dir, user)) if !dir.is_empty() && !user.is_empty() => {
            Ok((dir.to_string(), user.to_string()))
        }
        _ => Err(format!("expected DIR=USER, got '{value}'")),
    }
}

fn build_policy(args: &PolicyArgs, owner: &str) -> BucketPolicy {
    let mut policy = BucketPolicy::new(args.bucket.as_str(), owner);
    for user in &args.shares {
        policy.add_share(user.as_str());
    }
    for (dir, user) in &args.dirs {
        policy.add_own_dir(dir, user.as_str());
    }
    for (dir, user) in &args.share_dirs {
        policy.add_share_dir(dir, user.as_str());
    }
    policy
}

fn document_value(document: &str) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(document)?)
}

/// Execute the policy command
pub async fn execute(args: PolicyArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let bucket = args.bucket.clone();
    let (ctx, user) = (&session.ctx, session.user.as_str());

    if args.remove {
        return match session.client.delete_bucket_policy(ctx, user, &bucket).await {
            Ok(()) => {
                if formatter.is_json() {
                    formatter.json(&PolicyOutput {
                        status: "success",
                        bucket,
                        policy: None,
                    });
                } else {
                    formatter.success(&format!("Policy removed from '{bucket}'."));
                }
                ExitCode::Success
            }
            Err(e) => fail(formatter, "Failed to remove policy", &e),
        };
    }

    let document = if args.show {
        match session.client.get_bucket_policy(ctx, &bucket).await {
            Ok(document) => document,
            Err(e) => return fail(formatter, "Failed to read policy", &e),
        }
    } else {
        let owner = args.owner.as_deref().unwrap_or_default();
        let policy = build_policy(&args, owner);
        if args.apply
            && let Err(e) = session.client.put_bucket_policy(ctx, user, &policy).await
        {
            return fail(formatter, "Failed to apply policy", &e);
        }
        match policy.to_json() {
            Ok(document) => document,
            Err(e) => return fail(formatter, "Failed to render policy", &e),
        }
    };

    if formatter.is_json() {
        let value = match document_value(&document) {
            Ok(value) => value,
            Err(e) => return fail(formatter, "Invalid policy document", &e),
        };
        formatter.json(&PolicyOutput {
            status: "success",
            bucket,
            policy: Some(value),
        });
    } else {
        if args.apply {
            formatter.success(&format!("Policy applied to '{bucket}'."));
        }
        formatter.println(&document);
    }
    ExitCode::Success
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::commands::{Cli, Commands};

    fn parse(args: &[&str]) -> PolicyArgs {
        let mut argv = vec!["bfs", "policy"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Policy(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_grant() {
        assert_eq!(
            parse_grant("reports=bob").unwrap(),
            ("reports".to_string(), "bob".to_string())
        );
        assert!(parse_grant("reports").is_err());
        assert!(parse_grant("=bob").is_err());
    }

    #[test]
    fn test_owner_required_unless_inspecting() {
        let argv = ["bfs", "policy", "shared-data"];
        assert!(Cli::try_parse_from(argv).is_err());
        assert!(parse(&["shared-data", "--show"]).show);
        assert!(Cli::try_parse_from(["bfs", "policy", "shared-data", "--show", "--apply"]).is_err());
    }

    #[test]
    fn test_build_policy_document() {
        let args = parse(&[
            "shared-data",
            "--owner",
            "alice",
            "--share",
            "bob",
            "--dir",
            "reports=carol",
        ]);
        let policy = build_policy(&args, "alice");
        let value = document_value(&policy.to_json().unwrap()).unwrap();

        assert_eq!(value["Version"], "2012-10-17");
        let rendered = value.to_string();
        assert!(rendered.contains("arn:aws:iam:::user/alice"));
        assert!(rendered.contains("arn:aws:iam:::user/bob"));
        assert!(rendered.contains("arn:aws:s3:::shared-data/reports/*"));
        assert_eq!(policy.dir("reports").map(|d| d.owner.as_str()), Some("carol"));
    }
}
