//! share command - Generate a time-limited download URL
//!
//! When `remote.external_url` is configured the URL points at it instead
//! of the internal endpoint.

use std::time::Duration;

use bfs_core::parse_path;
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// Longest expiry a presigned URL may carry
const MAX_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Generate a download URL
#[derive(Args, Debug)]
pub struct ShareArgs {
    /// Object path (bucket/key)
    pub path: String,

    /// Expiry such as 90s, 30m, 12h or 7d (defaults to transfer.share_expiry_secs)
    #[arg(long, value_parser = parse_expiry)]
    pub expire: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct ShareOutput {
    path: String,
    url: String,
    expires_in_secs: u64,
}

/// Parse `<n>[s|m|h|d]`; a bare number is seconds
fn parse_expiry(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&value[..i], c),
        _ => (value, 's'),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid expiry '{value}'"))?;
    let secs = match unit {
        's' => n,
        'm' => n * 60,
        'h' => n * 60 * 60,
        'd' => n * 24 * 60 * 60,
        other => return Err(format!("unknown expiry unit '{other}' in '{value}'")),
    };
    let expiry = Duration::from_secs(secs);
    if expiry.is_zero() || expiry > MAX_EXPIRY {
        return Err(format!("expiry must be between 1s and 7d, got '{value}'"));
    }
    Ok(expiry)
}

/// Execute the share command
pub async fn execute(args: ShareArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let target = match parse_path(&args.path) {
        Ok(target) if !target.is_root() => target,
        Ok(_) => {
            formatter.error("Object key is required for share command.");
            return ExitCode::UsageError;
        }
        Err(e) => return fail(formatter, "Invalid path", &e),
    };

    let expiry = args
        .expire
        .unwrap_or_else(|| session.config.transfer.share_expiry());

    match session
        .client
        .presign_object(
            &session.ctx,
            &session.user,
            &target.bucket,
            &target.key,
            Some(expiry),
        )
        .await
    {
        Ok(url) => {
            if formatter.is_json() {
                formatter.json(&ShareOutput {
                    path: target.to_string(),
                    url,
                    expires_in_secs: expiry.as_secs(),
                });
            } else {
                formatter.println(&url);
            }
            ExitCode::Success
        }
        Err(e) => fail(formatter, &format!("Failed to share {target}"), &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expiry_units() {
        assert_eq!(parse_expiry("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_expiry("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_expiry("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_expiry("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_expiry("7d").unwrap(), MAX_EXPIRY);
    }

    #[test]
    fn test_parse_expiry_rejects_bad_values() {
        assert!(parse_expiry("").is_err());
        assert!(parse_expiry("0").is_err());
        assert!(parse_expiry("8d").is_err());
        assert!(parse_expiry("5w").is_err());
        assert!(parse_expiry("soon").is_err());
    }
}
