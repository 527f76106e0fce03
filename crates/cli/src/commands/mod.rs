//! CLI command definitions and execution
//!
//! Every command receives an opened [`Session`] (configuration, client and
//! a cancellation context tied to Ctrl+C) and returns an exit code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use bfs_core::{Client, Config, ConfigManager, Context, Error, LogSink, TracingSink};
use bfs_s3::S3Backend;
use clap::{Parser, Subcommand};

use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

mod cat;
mod ls;
mod mb;
mod policy;
mod put;
mod rb;
mod rm;
mod share;
mod stat;

/// bfs - bucketfs administration
///
/// Manage the buckets and objects a bucketfs mount presents as files.
#[derive(Parser, Debug)]
#[command(name = "bfs")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output format: human-readable or JSON
    #[arg(long, global = true, default_value = "false")]
    pub json: bool,

    /// Disable colored output
    #[arg(long, global = true, default_value = "false")]
    pub no_color: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true, default_value = "false")]
    pub quiet: bool,

    /// Enable debug logging
    #[arg(long, global = true, default_value = "false")]
    pub debug: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, env = "BFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// User name recorded in operation logs
    #[arg(long, global = true, env = "BFS_USER", default_value = "bfs")]
    pub user: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a bucket
    Mb(mb::MbArgs),

    /// Remove a bucket and everything in it
    Rb(rb::RbArgs),

    /// Show a bucket as a directory tree
    Ls(ls::LsArgs),

    /// Display object contents
    Cat(cat::CatArgs),

    /// Upload a file or stdin to an object
    Put(put::PutArgs),

    /// Remove objects
    Rm(rm::RmArgs),

    /// Show bucket or object metadata
    Stat(stat::StatArgs),

    /// Generate a time-limited download URL
    Share(share::ShareArgs),

    /// Generate, apply or inspect a bucket policy
    Policy(policy::PolicyArgs),
}

/// What every command needs to reach the store
pub struct Session {
    pub config: Config,
    pub client: Client,
    pub user: String,
    pub ctx: Context,
}

impl Session {
    /// Load configuration and connect the S3 backend
    pub async fn open(config_path: Option<&Path>, user: &str) -> anyhow::Result<Self> {
        let manager = match config_path {
            Some(path) => ConfigManager::with_path(path.to_path_buf()),
            None => ConfigManager::new()?,
        };
        let config = manager.load().with_context(|| {
            format!("loading configuration from {}", manager.config_path().display())
        })?;

        let sink: Arc<dyn LogSink> = Arc::new(TracingSink);
        let backend = S3Backend::new(&config)
            .await
            .context("creating S3 backend")?
            .with_sink(Arc::clone(&sink));
        let client = Client::new(Arc::new(backend), &config)?.with_sink(sink);

        Ok(Self {
            config,
            client,
            user: user.to_string(),
            ctx: Context::new(),
        })
    }
}

/// Exit code for a failure that may wrap a bfs error
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    err.downcast_ref::<Error>()
        .map(ExitCode::from)
        .unwrap_or(ExitCode::GeneralError)
}

/// Report `err` and return the matching exit code
pub(crate) fn fail(formatter: &Formatter, action: &str, err: &Error) -> ExitCode {
    formatter.error(&format!("{action}: {err}"));
    ExitCode::from(err)
}

/// Execute the CLI command and return an exit code
pub async fn execute(cli: Cli) -> ExitCode {
    let output_config = OutputConfig {
        json: cli.json,
        no_color: cli.no_color,
        quiet: cli.quiet,
    };
    let formatter = Formatter::new(output_config);

    let session = match Session::open(cli.config.as_deref(), &cli.user).await {
        Ok(session) => session,
        Err(e) => {
            formatter.error(&format!("{e:#}"));
            return exit_code_for(&e);
        }
    };

    // Ctrl+C cancels whatever is in flight
    let interrupt = session.ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::debug!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Mb(args) => mb::execute(args, &session, &formatter).await,
        Commands::Rb(args) => rb::execute(args, &session, &formatter).await,
        Commands::Ls(args) => ls::execute(args, &session, &formatter).await,
        Commands::Cat(args) => cat::execute(args, &session, &formatter).await,
        Commands::Put(args) => put::execute(args, &session, &formatter).await,
        Commands::Rm(args) => rm::execute(args, &session, &formatter).await,
        Commands::Stat(args) => stat::execute(args, &session, &formatter).await,
        Commands::Share(args) => share::execute(args, &session, &formatter).await,
        Commands::Policy(args) => policy::execute(args, &session, &formatter).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "bfs", "--json", "--config", "/tmp/bfs.toml", "ls", "my-data/docs",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/bfs.toml")));
        assert!(matches!(cli.command, Commands::Ls(_)));
    }

    #[test]
    fn test_exit_code_for_wrapped_error() {
        let err = anyhow::Error::new(Error::Config("bad endpoint".into())).context("loading");
        assert_eq!(exit_code_for(&err), ExitCode::UsageError);

        let other = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&other), ExitCode::GeneralError);
    }
}
