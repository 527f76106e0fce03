//! Bucket access policies
//!
//! A [`BucketPolicy`] records who owns a bucket, who it is shared with, and
//! per-directory owners and shares. It renders to an S3 policy document where
//! owners get read/write action sets and shared users read-only ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::path::clean_key;

/// Policy language version understood by S3-compatible servers
pub const POLICY_VERSION: &str = "2012-10-17";

const RW_DIR_ACTIONS: &[&str] = &[
    "s3:GetBucketLocation",
    "s3:ListBucket",
    "s3:DeleteObject",
    "s3:ListBucketMultipartUploads",
];

const RO_DIR_ACTIONS: &[&str] = &[
    "s3:GetBucketLocation",
    "s3:ListBucket",
    "s3:ListBucketMultipartUploads",
];

const RW_OBJECT_ACTIONS: &[&str] = &[
    "s3:AbortMultipartUpload",
    "s3:GetObject",
    "s3:DeleteObject",
    "s3:ListMultipartUploadParts",
    "s3:PutObject",
];

const RO_OBJECT_ACTIONS: &[&str] = &[
    "s3:AbortMultipartUpload",
    "s3:GetObject",
    "s3:ListMultipartUploadParts",
];

/// Rendered policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<Statement>,
}

/// One allow statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub effect: String,
    pub principal: Principal,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

/// Statement principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS")]
    pub aws: Vec<String>,
}

/// Owner and shares of one directory inside a bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirPolicy {
    pub owner: String,
    pub shares: Vec<String>,
}

/// Ownership and sharing of a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPolicy {
    bucket: String,
    owner: String,
    shares: Vec<String>,
    dirs: BTreeMap<String, DirPolicy>,
}

impl BucketPolicy {
    /// Policy for a bucket owned by `owner`
    pub fn new(bucket: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            owner: owner.into(),
            shares: Vec::new(),
            dirs: BTreeMap::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn shares(&self) -> &[String] {
        &self.shares
    }

    pub fn dir(&self, dir: &str) -> Option<&DirPolicy> {
        self.dirs.get(&clean_key(dir))
    }

    /// Grant read-only access to the whole bucket
    pub fn add_share(&mut self, user: impl Into<String>) {
        push_unique(&mut self.shares, user.into());
    }

    pub fn remove_share(&mut self, user: &str) {
        self.shares.retain(|u| u != user);
    }

    /// Make `user` the owner of `dir`, replacing its previous owner
    pub fn add_own_dir(&mut self, dir: &str, user: impl Into<String>) {
        self.dirs.entry(clean_key(dir)).or_default().owner = user.into();
    }

    pub fn remove_own_dir(&mut self, dir: &str) {
        self.dirs.remove(&clean_key(dir));
    }

    /// Grant read-only access to `dir`.
    ///
    /// A directory without an explicit owner is owned by the bucket owner.
    pub fn add_share_dir(&mut self, dir: &str, user: impl Into<String>) {
        let owner = self.owner.clone();
        let entry = self.dirs.entry(clean_key(dir)).or_insert_with(|| DirPolicy {
            owner,
            shares: Vec::new(),
        });
        push_unique(&mut entry.shares, user.into());
    }

    pub fn remove_share_dir(&mut self, dir: &str, user: &str) {
        if let Some(entry) = self.dirs.get_mut(&clean_key(dir)) {
            entry.shares.retain(|u| u != user);
        }
    }

    /// Build the policy document: bucket statements first, then one group
    /// per directory in name order
    pub fn document(&self) -> PolicyDocument {
        let mut statement = statements(
            &self.owner,
            &self.shares,
            format!("arn:aws:s3:::{}", self.bucket),
            format!("arn:aws:s3:::{}/*", self.bucket),
        );
        for (dir, policy) in &self.dirs {
            statement.extend(statements(
                &policy.owner,
                &policy.shares,
                format!("arn:aws:s3:::{}/{dir}", self.bucket),
                format!("arn:aws:s3:::{}/{dir}/*", self.bucket),
            ));
        }
        PolicyDocument {
            version: POLICY_VERSION.to_string(),
            statement,
        }
    }

    /// Render the policy as compact JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.document())?)
    }
}

fn push_unique(users: &mut Vec<String>, user: String) {
    if !users.contains(&user) {
        users.push(user);
    }
}

fn principal(users: &[String]) -> Principal {
    Principal {
        aws: users
            .iter()
            .map(|u| format!("arn:aws:iam:::user/{u}"))
            .collect(),
    }
}

fn allow(principal: Principal, actions: &[&str], resource: &str) -> Statement {
    Statement {
        effect: "Allow".to_string(),
        principal,
        action: actions.iter().map(|a| a.to_string()).collect(),
        resource: vec![resource.to_string()],
    }
}

fn statements(
    owner: &str,
    shares: &[String],
    dir_resource: String,
    object_resource: String,
) -> Vec<Statement> {
    let owner = principal(&[owner.to_string()]);
    let mut out = vec![
        allow(owner.clone(), RW_DIR_ACTIONS, &dir_resource),
        allow(owner, RW_OBJECT_ACTIONS, &object_resource),
    ];
    if !shares.is_empty() {
        let shared = principal(shares);
        out.push(allow(shared.clone(), RO_DIR_ACTIONS, &dir_resource));
        out.push(allow(shared, RO_OBJECT_ACTIONS, &object_resource));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_only_policy() {
        let doc = BucketPolicy::new("photos", "alice").document();
        assert_eq!(doc.version, "2012-10-17");
        assert_eq!(doc.statement.len(), 2);

        let bucket = &doc.statement[0];
        assert_eq!(bucket.principal.aws, vec!["arn:aws:iam:::user/alice"]);
        assert_eq!(bucket.resource, vec!["arn:aws:s3:::photos"]);
        assert!(bucket.action.contains(&"s3:DeleteObject".to_string()));

        let objects = &doc.statement[1];
        assert_eq!(objects.resource, vec!["arn:aws:s3:::photos/*"]);
        assert!(objects.action.contains(&"s3:PutObject".to_string()));
    }

    #[test]
    fn test_shared_users_are_read_only() {
        let mut policy = BucketPolicy::new("photos", "alice");
        policy.add_share("bob");
        policy.add_share("carol");
        policy.add_share("bob");

        let doc = policy.document();
        assert_eq!(doc.statement.len(), 4);
        let shared = &doc.statement[3];
        assert_eq!(
            shared.principal.aws,
            vec!["arn:aws:iam:::user/bob", "arn:aws:iam:::user/carol"]
        );
        assert!(!shared.action.contains(&"s3:PutObject".to_string()));
        assert!(!doc.statement[2].action.contains(&"s3:DeleteObject".to_string()));
    }

    #[test]
    fn test_remove_share() {
        let mut policy = BucketPolicy::new("photos", "alice");
        policy.add_share("bob");
        policy.remove_share("bob");
        assert!(policy.shares().is_empty());
        assert_eq!(policy.document().statement.len(), 2);
    }

    #[test]
    fn test_dir_policies_use_their_own_shares() {
        let mut policy = BucketPolicy::new("photos", "alice");
        policy.add_share("bob");
        policy.add_own_dir("/2024/", "dave");
        policy.add_share_dir("2024", "erin");

        let doc = policy.document();
        assert_eq!(doc.statement.len(), 8);
        assert_eq!(doc.statement[4].resource, vec!["arn:aws:s3:::photos/2024"]);
        assert_eq!(doc.statement[4].principal.aws, vec!["arn:aws:iam:::user/dave"]);
        assert_eq!(doc.statement[7].resource, vec!["arn:aws:s3:::photos/2024/*"]);
        assert_eq!(doc.statement[7].principal.aws, vec!["arn:aws:iam:::user/erin"]);

        policy.remove_share_dir("2024", "erin");
        assert!(policy.dir("2024").unwrap().shares.is_empty());
        policy.remove_own_dir("2024");
        assert!(policy.dir("2024").is_none());
    }

    #[test]
    fn test_json_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&BucketPolicy::new("b1", "u").to_json().unwrap()).unwrap();
        assert_eq!(json["Version"], "2012-10-17");
        assert_eq!(json["Statement"][0]["Effect"], "Allow");
        assert_eq!(json["Statement"][0]["Principal"]["AWS"][0], "arn:aws:iam:::user/u");
    }
}
