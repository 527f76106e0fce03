//! cat command - Display object contents
//!
//! Streams an object to stdout through the same read pipeline a mounted
//! file uses: read-ahead for large objects, byte accounting and
//! cancellation on Ctrl+C.

use bfs_core::{
    ByteLimit, Client, Context, Error, FileHandle, OpenOptions, Result, parse_path,
};
use clap::Args;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

const CHUNK_SIZE: usize = 64 * 1024;

/// Display object contents
#[derive(Args, Debug)]
pub struct CatArgs {
    /// Object path (bucket/key)
    pub path: String,

    /// Start reading at this byte offset
    #[arg(long, default_value = "0")]
    pub offset: u64,

    /// Stop after this many bytes
    #[arg(long)]
    pub limit: Option<u64>,
}

/// Execute the cat command
pub async fn execute(args: CatArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let target = match parse_path(&args.path) {
        Ok(target) if !target.is_root() => target,
        Ok(_) => {
            formatter.error("Object key is required for cat command.");
            return ExitCode::UsageError;
        }
        Err(e) => return fail(formatter, "Invalid path", &e),
    };

    let mut stdout = tokio::io::stdout();
    match copy_object(
        &session.ctx,
        &session.client,
        &target.bucket,
        &target.key,
        args.offset,
        args.limit,
        &mut stdout,
    )
    .await
    {
        Ok(bytes) => {
            tracing::debug!(bytes, "cat finished");
            ExitCode::Success
        }
        Err(e) => fail(formatter, &format!("Failed to read {target}"), &e),
    }
}

/// Copy an object into `out` and return the number of bytes written
async fn copy_object<W>(
    ctx: &Context,
    client: &Client,
    bucket: &str,
    key: &str,
    offset: u64,
    limit: Option<u64>,
    out: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let info = client.head_object(ctx, bucket, key).await?;
    let options = OpenOptions {
        size: info.size_bytes,
        offset,
        limit: limit.map(ByteLimit::new),
    };
    let handle = FileHandle::open_read(ctx, client.clone(), bucket, key, options).await?;

    let copied = copy_handle(&handle, out).await;
    let closed = handle.close().await;
    handle.done().await;
    let copied = copied?;
    closed?;
    Ok(copied)
}

async fn copy_handle<W>(handle: &FileHandle, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = handle.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await.map_err(Error::from_io)?;
        total += n as u64;
    }
    out.flush().await.map_err(Error::from_io)?;
    Ok(total)
}
