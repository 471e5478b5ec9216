//! Fetches and prepares a deployment's source tree.
//!
//! Shells out to the system `git` binary rather than linking `libgit2`:
//! depth-limited, single-branch clones are a one-line invocation and need
//! no extra dependency.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
    /// Shallow-clones `branch` of `repo_url` into `dest`, clearing any
    /// prior contents first. Rejects partial clones (non-zero git exit).
    ///
    /// Named `clone_repo`, not `clone`, so implementors can be held behind
    /// an `Arc<dyn SourceFetcher>` without the method being shadowed by
    /// `Clone::clone` at the call site.
    async fn clone_repo(&self, repo_url: &str, branch: &str, dest: &Path) -> Result<()>;

    /// Confirms the clone has a usable recipe (a `Dockerfile` at its root).
    async fn validate_recipe(&self, workdir: &Path) -> Result<()>;

    /// Patches known-bad recipe steps in place, returning a human-readable
    /// note for each patch applied (persisted into the build log).
    async fn normalize_recipe(&self, workdir: &Path) -> Result<Vec<String>>;

    /// Best-effort guess at the port the built image will listen on.
    async fn detect_port(&self, workdir: &Path) -> Result<u16>;
}

const DEFAULT_PORT: u16 = 8080;

pub struct GitSourceFetcher;

impl GitSourceFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GitSourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn clone_repo(&self, repo_url: &str, branch: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        tokio::fs::create_dir_all(dest).await?;

        let output = Command::new("git")
            .args([
                "clone",
                "--depth",
                "1",
                "--branch",
                branch,
                repo_url,
                &dest.to_string_lossy(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Clear the partial clone so a retry starts from a clean slate.
            let _ = tokio::fs::remove_dir_all(dest).await;
            return Err(Error::Input(format!("git clone failed: {}", stderr.trim())));
        }

        Ok(())
    }

    async fn validate_recipe(&self, workdir: &Path) -> Result<()> {
        if !workdir.join("Dockerfile").is_file() {
            return Err(Error::Input(
                "recipe not found in repository root (expected a Dockerfile)".to_string(),
            ));
        }
        Ok(())
    }

    async fn normalize_recipe(&self, workdir: &Path) -> Result<Vec<String>> {
        let mut notes = Vec::new();
        let dockerfile_path = workdir.join("Dockerfile");
        let contents = tokio::fs::read_to_string(&dockerfile_path).await?;

        let has_lockfile = workdir.join("package-lock.json").is_file();
        if contents.contains("npm ci") && !has_lockfile {
            let patched = contents.replace("npm ci", "npm install");
            tokio::fs::write(&dockerfile_path, patched).await?;
            notes.push(
                "patched `npm ci` to `npm install`: no package-lock.json present".to_string(),
            );
        }

        Ok(notes)
    }

    async fn detect_port(&self, workdir: &Path) -> Result<u16> {
        if let Some(port) = detect_port_from_dockerfile(workdir).await? {
            return Ok(port);
        }
        if let Some(port) = detect_port_from_package_json(workdir).await? {
            return Ok(port);
        }
        if let Some(port) = detect_port_from_dotenv(workdir).await? {
            return Ok(port);
        }
        Ok(DEFAULT_PORT)
    }
}

async fn detect_port_from_dockerfile(workdir: &Path) -> Result<Option<u16>> {
    let path = workdir.join("Dockerfile");
    if !path.is_file() {
        return Ok(None);
    }
    let contents = tokio::fs::read_to_string(&path).await?;
    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("EXPOSE") {
            if let Some(port) = rest.split_whitespace().next().and_then(|p| p.parse().ok()) {
                return Ok(Some(port));
            }
        }
    }
    Ok(None)
}

async fn detect_port_from_package_json(workdir: &Path) -> Result<Option<u16>> {
    let path = workdir.join("package.json");
    if !path.is_file() {
        return Ok(None);
    }
    let contents = tokio::fs::read_to_string(&path).await?;
    Ok(find_port_env_hint(&contents))
}

async fn detect_port_from_dotenv(workdir: &Path) -> Result<Option<u16>> {
    let path = workdir.join(".env");
    if !path.is_file() {
        return Ok(None);
    }
    let contents = tokio::fs::read_to_string(&path).await?;
    Ok(find_port_env_hint(&contents))
}

/// Looks for a `PORT=<n>` or `"PORT": "<n>"` style hint anywhere in the file.
fn find_port_env_hint(contents: &str) -> Option<u16> {
    for line in contents.lines() {
        let line = line.trim().trim_matches(|c| c == '"' || c == ',');
        if let Some(rest) = line.strip_prefix("PORT=") {
            if let Ok(port) = rest.trim().parse() {
                return Some(port);
            }
        }
        if let Some(idx) = line.find("PORT") {
            let tail = &line[idx + "PORT".len()..];
            let digits: String = tail
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(port) = digits.parse() {
                return Some(port);
            }
        }
    }
    None
}

/// `<workroot>/deployment-<id>/`, per the documented filesystem layout —
/// `deployment_id` alone already partitions this path (deployment ids are
/// globally unique), `app_id` is accepted only so callers don't need to
/// look it up separately.
pub fn deployment_workdir(workroot: &Path, _app_id: &str, deployment_id: i64) -> PathBuf {
    workroot.join(format!("deployment-{deployment_id}"))
}
