//! ls command - Show a bucket as a directory tree
//!
//! Without `--recursive` one directory level is listed, the way a mount
//! would see it on first access. With it the whole bucket is loaded and
//! drawn as a tree.

use bfs_core::tree::DirNode;
use bfs_core::{Context, Result, TreeBuilder, TreeNode, parse_path};
use clap::Args;
use serde::Serialize;

use super::{Session, fail};
use crate::exit_code::ExitCode;
use crate::output::Formatter;

/// List a bucket as directories and files
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Bucket path (bucket[/dir])
    pub path: String,

    /// Load and show the whole subtree
    #[arg(short, long)]
    pub recursive: bool,

    /// Summarize output (show totals)
    #[arg(long)]
    pub summarize: bool,
}

/// One row of the JSON output
#[derive(Debug, Serialize, PartialEq)]
struct Entry {
    path: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
}

#[derive(Debug, Serialize)]
struct LsOutput {
    bucket: String,
    items: Vec<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<Summary>,
}

#[derive(Debug, Serialize)]
struct Summary {
    total_files: usize,
    total_dirs: usize,
    total_size_bytes: u64,
    total_size_human: String,
}

/// Execute the ls command
pub async fn execute(args: LsArgs, session: &Session, formatter: &Formatter) -> ExitCode {
    let target = match parse_path(&args.path) {
        Ok(target) => target,
        Err(e) => return fail(formatter, "Invalid path", &e),
    };

    let builder = TreeBuilder::new(session.client.clone(), &target.bucket);
    let node = match load(&builder, &session.ctx, &target.key, args.recursive).await {
        Ok(node) => node,
        Err(e) => return fail(formatter, "Failed to list", &e),
    };

    let entries = entries(&node, args.recursive);
    let summary = args.summarize.then(|| summarize(&entries));

    if formatter.is_json() {
        formatter.json(&LsOutput {
            bucket: target.bucket,
            items: entries,
            summary,
        });
        return ExitCode::Success;
    }

    match &node {
        TreeNode::Directory(dir) if args.recursive => {
            formatter.println(&formatter.dir_name(&target.to_string()));
            let mut lines = Vec::new();
            render_tree(formatter, dir, "", &mut lines);
            for line in lines {
                formatter.println(&line);
            }
        }
        TreeNode::Directory(dir) => {
            for (name, child) in dir.children() {
                formatter.println(&render_row(formatter, &name, &child));
            }
        }
        TreeNode::File(_) => formatter.println(&render_row(formatter, node.name(), &node)),
    }

    if let Some(summary) = summary {
        formatter.println(&format!(
            "\nTotal: {} directories, {} files, {}",
            summary.total_dirs, summary.total_files, summary.total_size_human
        ));
    }
    ExitCode::Success
}

/// Build as much of the tree as the listing needs and return the node at
/// `path`
async fn load(builder: &TreeBuilder, ctx: &Context, path: &str, recursive: bool) -> Result<TreeNode> {
    if recursive {
        builder.load_all(ctx).await?;
        return builder.tree().lookup(path);
    }
    let node = builder.resolve(ctx, path).await?;
    if let TreeNode::Directory(_) = node {
        builder.children(ctx, path).await?;
    }
    Ok(node)
}

fn entry(node: &TreeNode) -> Entry {
    match node {
        TreeNode::Directory(dir) => Entry {
            path: format!("{}/", dir.path()),
            kind: "dir",
            size_bytes: None,
            size_human: None,
            last_modified: None,
        },
        TreeNode::File(file) => Entry {
            path: file.key().to_string(),
            kind: "file",
            size_bytes: Some(file.size()),
            size_human: Some(humansize::format_size(file.size(), humansize::BINARY)),
            last_modified: file.modified().map(|t| t.to_string()),
        },
    }
}

/// Flatten `node` depth-first. Directories are listed before their content.
fn entries(node: &TreeNode, recursive: bool) -> Vec<Entry> {
    let TreeNode::Directory(dir) = node else {
        return vec![entry(node)];
    };
    let mut out = Vec::new();
    let mut stack: Vec<TreeNode> = dir.children().into_iter().rev().map(|(_, n)| n).collect();
    while let Some(next) = stack.pop() {
        out.push(entry(&next));
        if recursive && let TreeNode::Directory(sub) = &next {
            stack.extend(sub.children().into_iter().rev().map(|(_, n)| n));
        }
    }
    out
}

fn summarize(entries: &[Entry]) -> Summary {
    let total_size_bytes = entries.iter().filter_map(|e| e.size_bytes).sum();
    Summary {
        total_files: entries.iter().filter(|e| e.kind == "file").count(),
        total_dirs: entries.iter().filter(|e| e.kind == "dir").count(),
        total_size_bytes,
        total_size_human: humansize::format_size(total_size_bytes, humansize::BINARY),
    }
}

fn render_row(formatter: &Formatter, name: &str, node: &TreeNode) -> String {
    match node {
        TreeNode::Directory(_) => {
            format!("{} {:>10} {}", " ".repeat(21), "-", formatter.dir_name(name))
        }
        TreeNode::File(file) => {
            let date = file
                .modified()
                .map(|d| d.strftime("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| " ".repeat(19));
            let size = humansize::format_size(file.size(), humansize::BINARY);
            format!("{} {size:>10} {name}", formatter.dim(&format!("[{date}]")))
        }
    }
}

fn render_tree(formatter: &Formatter, dir: &DirNode, prefix: &str, out: &mut Vec<String>) {
    let children = dir.children();
    let count = children.len();
    for (i, (name, node)) in children.into_iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└── " } else { "├── " };
        match node {
            TreeNode::Directory(sub) => {
                out.push(format!("{prefix}{branch}{}", formatter.dir_name(&name)));
                let indent = if last { "    " } else { "│   " };
                render_tree(formatter, &sub, &format!("{prefix}{indent}"), out);
            }
            TreeNode::File(file) => {
                let size = humansize::format_size(file.size(), humansize::BINARY);
                out.push(format!("{prefix}{branch}{name} {}", formatter.dim(&format!("({size})"))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bfs_core::{Client, Config, MemoryBackend};
    use bytes::Bytes;

    use super::*;
    use crate::output::OutputConfig;

    async fn builder(keys: &[&str]) -> TreeBuilder {
        let client = Client::new(Arc::new(MemoryBackend::new()), &Config::default()).unwrap();
        let ctx = Context::new();
        client.create_bucket(&ctx, "test", "photos").await.unwrap();
        for key in keys {
            client
                .put_object(&ctx, "test", "photos", key, Bytes::from_static(b"1234"))
                .await
                .unwrap();
        }
        TreeBuilder::new(client, "photos")
    }

    fn plain() -> Formatter {
        Formatter::new(OutputConfig {
            no_color: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_single_level_listing() {
        let builder = builder(&["a/b/c.txt", "a/e.txt", "top.txt"]).await;
        let node = load(&builder, &Context::new(), "a", false).await.unwrap();

        let paths: Vec<_> = entries(&node, false).into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["a/b/", "a/e.txt"]);
    }

    #[tokio::test]
    async fn test_recursive_entries_are_depth_first() {
        let builder = builder(&["a/b/c.txt", "a/b/d.txt", "a/e.txt"]).await;
        let node = load(&builder, &Context::new(), "", true).await.unwrap();

        let paths: Vec<_> = entries(&node, true).into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["a/", "a/b/", "a/b/c.txt", "a/b/d.txt", "a/e.txt"]);

        let summary = summarize(&entries(&node, true));
        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.total_dirs, 2);
        assert_eq!(summary.total_size_bytes, 12);
    }

    #[tokio::test]
    async fn test_render_tree() {
        let builder = builder(&["a/b/c.txt", "a/e.txt", "z.txt"]).await;
        let node = load(&builder, &Context::new(), "", true).await.unwrap();
        let TreeNode::Directory(root) = node else {
            panic!("root is a directory");
        };

        let mut lines = Vec::new();
        render_tree(&plain(), &root, "", &mut lines);
        assert_eq!(
            lines,
            vec![
                "├── a/",
                "│   ├── b/",
                "│   │   └── c.txt (4 B)",
                "│   └── e.txt (4 B)",
                "└── z.txt (4 B)",
            ]
        );
    }

    #[tokio::test]
    async fn test_listing_a_file() {
        let builder = builder(&["a/e.txt"]).await;
        let node = load(&builder, &Context::new(), "a/e.txt", false).await.unwrap();
        let listed = entries(&node, false);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, "file");
        assert_eq!(listed[0].size_bytes, Some(4));
    }

    #[tokio::test]
    async fn test_missing_path() {
        let builder = builder(&["a/e.txt"]).await;
        let result = load(&builder, &Context::new(), "nope", false).await;
        assert!(matches!(result, Err(bfs_core::Error::NotFound(_))));
    }
}
