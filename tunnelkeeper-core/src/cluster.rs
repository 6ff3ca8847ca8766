//! Cluster collaborator seam.
//!
//! Everything that talks to the login tool or the cluster API goes through
//! [`ClusterClient`]. Calls may block for a long time; they are only ever awaited
//! inside background tasks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CLUSTER_SEPARATOR, qualify_secondary};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoginOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub ready: u32,
    pub total: u32,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unexpected output from {program}: {reason}")]
    Parse { program: String, reason: String },
}

/// Clusters known to the login tool, used only for input completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterCatalog {
    pub primaries: Vec<String>,
    pub secondaries: BTreeMap<String, Vec<String>>,
}

impl ClusterCatalog {
    /// Builds a catalog from flat cluster names: a name that is some other name
    /// followed by the separator is filed as that name's secondary.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        let mut catalog = ClusterCatalog::default();
        for name in &names {
            let parent = names
                .iter()
                .filter(|p| *p != name && qualify_secondary(p, name) == *name)
                .max_by_key(|p| p.len());
            match parent {
                Some(parent) => {
                    let child = name[parent.len() + CLUSTER_SEPARATOR.len()..].to_string();
                    catalog
                        .secondaries
                        .entry(parent.clone())
                        .or_default()
                        .push(child);
                }
                None => catalog.primaries.push(name.clone()),
            }
        }
        catalog
    }

    pub fn secondaries_of(&self, primary: &str) -> &[String] {
        self.secondaries
            .get(primary)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Splits a fully qualified cluster name into a (primary, secondary) pair.
    pub fn resolve(&self, cluster: &str) -> Option<(String, Option<String>)> {
        if self.primaries.iter().any(|p| p == cluster) {
            return Some((cluster.to_string(), None));
        }
        self.secondaries.iter().find_map(|(primary, children)| {
            children
                .iter()
                .find(|child| qualify_secondary(primary, child) == cluster)
                .map(|child| (primary.clone(), Some(child.clone())))
        })
    }
}

/// Completes `prefix` against `candidates`.
///
/// A unique match completes fully; several matches complete to their longest
/// common prefix. Returns `None` when nothing would change.
pub fn complete(prefix: &str, candidates: &[String]) -> Option<String> {
    let matches: Vec<&String> = candidates
        .iter()
        .filter(|c| c.starts_with(prefix))
        .collect();
    let first = matches.first()?;

    let common = matches.iter().skip(1).fold(first.as_str(), |acc, c| {
        let len = acc
            .char_indices()
            .zip(c.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map(|((i, a), _)| i + a.len_utf8())
            .unwrap_or(0);
        &acc[..len]
    });

    (common.len() > prefix.len()).then(|| common.to_string())
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn authenticate(&self, cluster: &str) -> Result<LoginOutput, ClientError>;

    async fn switch_context(&self, context: &str) -> Result<(), ClientError>;

    async fn active_context(&self) -> Result<String, ClientError>;

    async fn node_readiness(&self, context: &str) -> Result<NodeCounts, ClientError>;

    async fn list_clusters(&self) -> Result<ClusterCatalog, ClientError>;
}
