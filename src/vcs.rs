//! Version Control Collaborator
//!
//! The narrow set of repository primitives the pipeline needs: stage,
//! commit, short HEAD hash, last-commit file list, fetch, pull, behind
//! count and summaries, stash. Any tool exposing these is substitutable;
//! `GitCli` shells out to the `git` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

/// Repository primitives used by the implementer and the self-updater.
pub trait VersionControl: Send + Sync {
    fn stage(&self, path: &str) -> Result<()>;
    fn commit(&self, message: &str) -> Result<()>;
    fn short_head(&self) -> Result<String>;
    /// Files changed by the most recent commit.
    fn last_commit_files(&self) -> Result<Vec<String>>;
    fn fetch(&self) -> Result<()>;
    fn pull(&self) -> Result<String>;
    /// How many commits local HEAD is behind its upstream.
    fn behind_count(&self) -> Result<u32>;
    /// One-line summaries of the commits local HEAD is behind.
    fn behind_summaries(&self) -> Result<Vec<String>>;
    /// Best-effort stash of local changes.
    fn stash(&self) -> Result<()>;
}

/// `git` CLI implementation rooted at a repository path.
pub struct GitCli {
    repo_path: PathBuf,
}

impl GitCli {
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
        }
    }

    /// Run a git command in the repository and return its stdout.
    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .with_context(|| format!("Failed to execute git {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    }
}

impl VersionControl for GitCli {
    fn stage(&self, path: &str) -> Result<()> {
        self.git(&["add", path]).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.git(&["commit", "-m", message]).map(|_| ())
    }

    fn short_head(&self) -> Result<String> {
        self.git(&["rev-parse", "--short", "HEAD"])
    }

    fn last_commit_files(&self) -> Result<Vec<String>> {
        let out = self.git(&["diff", "--name-only", "HEAD~1", "HEAD"])?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    fn fetch(&self) -> Result<()> {
        self.git(&["fetch", "origin", "--quiet"]).map(|_| ())
    }

    fn pull(&self) -> Result<String> {
        self.git(&["pull", "--ff-only"])
    }

    fn behind_count(&self) -> Result<u32> {
        let out = self
            .git(&["rev-list", "--count", "HEAD..@{u}"])
            .unwrap_or_else(|_| "0".to_string());
        Ok(out.parse().unwrap_or(0))
    }

    fn behind_summaries(&self) -> Result<Vec<String>> {
        let out = self.git(&["log", "--oneline", "HEAD..@{u}"]).unwrap_or_default();
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    fn stash(&self) -> Result<()> {
        self.git(&["stash", "--include-untracked"]).map(|_| ())
    }
}
