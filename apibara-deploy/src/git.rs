use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};

use crate::{process, Result};

pub const DEFAULT_BRANCH: &str = "main";

/// An immutable snapshot of a repository at a branch. Cloning the handle is cheap; the directory
/// backing a fetched tree is removed once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct SourceTree {
    repo_url: String,
    branch: String,
    root: PathBuf,
    _checkout: Option<Arc<tempfile::TempDir>>,
}

impl SourceTree {
    /// Wraps a directory that is managed by the caller.
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>, root: PathBuf) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: branch.into(),
            root,
            _checkout: None,
        }
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Narrows the tree to a subdirectory. Leading slashes are ignored so the result always stays
    /// below the current root.
    pub fn directory(&self, subdir: &str) -> Self {
        Self {
            root: self.root.join(subdir.trim_start_matches('/')),
            ..self.clone()
        }
    }
}

pub trait SourceFetcher: Sync {
    fn fetch(&self, repo_url: &str, branch: &str) -> Result<SourceTree>;
}

/// Fetches sources with a shallow, single branch `git clone`.
pub struct GitFetcher;

/// Repository URLs are commonly written without a scheme, e.g. `github.com/org/repo`. Git would
/// treat those as local paths, so they are cloned over https.
pub fn clone_url(repo_url: &str) -> String {
    let is_local = repo_url.starts_with('/') || repo_url.starts_with('.');
    let has_scheme = repo_url.contains("://");
    // scp-like syntax, e.g. `git@github.com:org/repo.git`
    let is_scp = repo_url
        .split_once(':')
        .is_some_and(|(host, _)| host.contains('@') && !host.contains('/'));

    if is_local || has_scheme || is_scp {
        repo_url.to_owned()
    } else {
        format!("https://{repo_url}")
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, repo_url: &str, branch: &str) -> Result<SourceTree> {
        let checkout = tempfile::Builder::new()
            .prefix("apibara-deploy-src-")
            .tempdir()?;
        let url = clone_url(repo_url);

        info!("fetching {url} at branch {branch}...");
        process::command!(
            "git",
            "clone",
            "--quiet",
            "--depth",
            "1",
            "--single-branch",
            "--branch",
            branch,
            &url,
            checkout.path(),
        )
        .output()?;

        let commit_hash = process::command!("git", "-C", checkout.path(), "rev-parse", "HEAD")
            .output()?
            .stdout_trimmed()?;
        debug!("git commit hash: {commit_hash}");

        Ok(SourceTree {
            repo_url: repo_url.to_owned(),
            branch: branch.to_owned(),
            root: checkout.path().to_owned(),
            _checkout: Some(Arc::new(checkout)),
        })
    }
}
