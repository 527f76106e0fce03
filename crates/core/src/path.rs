//! Path parsing and key normalization
//!
//! Object keys are treated as paths relative to the bucket root. Every
//! client call cleans the caller's path before composing a backend key, so
//! `/a/./b//c.txt`, `a/b/c.txt` and `x/../a/b/c.txt` all name the same object.

use crate::error::{Error, Result};

/// Hierarchy delimiter used by convention in object keys
pub const DELIMITER: char = '/';

/// Minimum accepted bucket name length (exclusive)
const MIN_BUCKET_NAME_LEN: usize = 2;

/// A bucket plus a cleaned object key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    /// Bucket name
    pub bucket: String,
    /// Cleaned object key (empty for the bucket root)
    pub key: String,
}

impl ObjectPath {
    /// Create a new ObjectPath, cleaning the key relative to the bucket root
    pub fn new(bucket: impl Into<String>, path: &str) -> Self {
        Self {
            bucket: bucket.into(),
            key: clean_key(path),
        }
    }

    /// Whether this path names the bucket root
    pub fn is_root(&self) -> bool {
        self.key.is_empty()
    }

    /// Directory part of the key, including the trailing delimiter
    pub fn dir(&self) -> &str {
        match self.key.rfind(DELIMITER) {
            Some(pos) => &self.key[..=pos],
            None => "",
        }
    }

    /// Last component of the key
    pub fn name(&self) -> &str {
        match self.key.rfind(DELIMITER) {
            Some(pos) => &self.key[pos + 1..],
            None => &self.key,
        }
    }

    /// Get the parent path (one level up)
    pub fn parent(&self) -> Option<Self> {
        if self.key.is_empty() {
            return None;
        }
        Some(Self {
            bucket: self.bucket.clone(),
            key: self.dir().trim_end_matches(DELIMITER).to_string(),
        })
    }

    /// Join a child path component
    pub fn join(&self, child: &str) -> Self {
        let key = if self.key.is_empty() {
            clean_key(child)
        } else {
            clean_key(&format!("{}/{child}", self.key))
        };
        Self {
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// Key prefix used to list the children of this path as a directory
    pub fn list_prefix(&self) -> Option<String> {
        if self.key.is_empty() {
            None
        } else {
            Some(format!("{}{DELIMITER}", self.key))
        }
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.bucket)
        } else {
            write!(f, "{}/{}", self.bucket, self.key)
        }
    }
}

/// Clean a path relative to the bucket root.
///
/// Drops empty and `.` components and resolves `..` against the components
/// seen so far. `..` at the root stays at the root.
pub fn clean_key(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split(DELIMITER) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

/// Split a key into its non-empty components
pub fn components(key: &str) -> impl Iterator<Item = &str> {
    key.split(DELIMITER).filter(|c| !c.is_empty())
}

/// Validate a bucket name
pub fn validate_bucket_name(name: &str) -> Result<()> {
    if name.len() <= MIN_BUCKET_NAME_LEN {
        return Err(Error::Validation(format!(
            "bucket name '{name}' must be longer than {MIN_BUCKET_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Parse a `bucket[/key]` argument into an ObjectPath
pub fn parse_path(path: &str) -> Result<ObjectPath> {
    let path = path.trim_start_matches(DELIMITER);
    if path.is_empty() {
        return Err(Error::Validation("Path cannot be empty".into()));
    }

    let (bucket, key) = match path.split_once(DELIMITER) {
        Some((bucket, key)) => (bucket, key),
        None => (path, ""),
    };

    if bucket.is_empty() {
        return Err(Error::Validation("Bucket name cannot be empty".into()));
    }

    Ok(ObjectPath::new(bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_key() {
        assert_eq!(clean_key("a/b/c.txt"), "a/b/c.txt");
        assert_eq!(clean_key("/a/./b//c.txt"), "a/b/c.txt");
        assert_eq!(clean_key("x/../a/b/c.txt"), "a/b/c.txt");
        assert_eq!(clean_key("../../etc/passwd"), "etc/passwd");
        assert_eq!(clean_key("dir/"), "dir");
        assert_eq!(clean_key("."), "");
        assert_eq!(clean_key(""), "");
    }

    #[test]
    fn test_object_path_dir_and_name() {
        let path = ObjectPath::new("bucket", "a/b/c.txt");
        assert_eq!(path.dir(), "a/b/");
        assert_eq!(path.name(), "c.txt");

        let path = ObjectPath::new("bucket", "top.txt");
        assert_eq!(path.dir(), "");
        assert_eq!(path.name(), "top.txt");
    }

    #[test]
    fn test_object_path_parent() {
        let path = ObjectPath::new("bucket", "a/b/c.txt");
        let parent = path.parent().unwrap();
        assert_eq!(parent.key, "a/b");

        let parent = parent.parent().unwrap();
        assert_eq!(parent.key, "a");

        let parent = parent.parent().unwrap();
        assert_eq!(parent.key, "");
        assert!(parent.is_root());

        assert!(parent.parent().is_none());
    }

    #[test]
    fn test_object_path_join() {
        let root = ObjectPath::new("bucket", "");
        let dir = root.join("dir");
        assert_eq!(dir.key, "dir");
        assert_eq!(dir.list_prefix().as_deref(), Some("dir/"));
        assert_eq!(root.list_prefix(), None);

        let file = dir.join("./file.txt");
        assert_eq!(file.key, "dir/file.txt");
    }

    #[test]
    fn test_object_path_display() {
        assert_eq!(ObjectPath::new("bucket", "key/file.txt").to_string(), "bucket/key/file.txt");
        assert_eq!(ObjectPath::new("bucket", "").to_string(), "bucket");
    }

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("").is_err());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("abc").is_ok());
        assert!(validate_bucket_name("my-data").is_ok());
    }

    #[test]
    fn test_parse_path() {
        let path = parse_path("mybucket/path/to/file.txt").unwrap();
        assert_eq!(path.bucket, "mybucket");
        assert_eq!(path.key, "path/to/file.txt");

        let path = parse_path("mybucket").unwrap();
        assert_eq!(path.bucket, "mybucket");
        assert!(path.is_root());

        let path = parse_path("/mybucket/dir/").unwrap();
        assert_eq!(path.key, "dir");
    }

    #[test]
    fn test_parse_empty_path() {
        assert!(parse_path("").is_err());
        assert!(parse_path("/").is_err());
    }

    #[test]
    fn test_components_skip_empty() {
        let parts: Vec<&str> = components("/a//b/c.txt").collect();
        assert_eq!(parts, vec!["a", "b", "c.txt"]);
    }
}
