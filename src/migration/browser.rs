//! Source-repository browsing.
//!
//! Used by the REST layer and the `browse` command to show how a repository
//! is laid out before a migration is submitted. The orchestrator never calls
//! it.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::runner::CommandLine;
use crate::errors::MigrationError;

/// Lists the entries directly under a repository path. Directory entries end
/// with `/`, as `svn ls` prints them.
#[async_trait]
pub trait SourceBrowser: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<String>, MigrationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SvnModule {
    pub name: String,
    pub path: String,
    pub sub_modules: Vec<SvnModule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryStructure {
    pub name: String,
    /// True when the repository root holds `trunk` directly.
    pub flat: bool,
    pub modules: Vec<SvnModule>,
}

pub struct SvnBrowser {
    program: String,
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl SvnBrowser {
    pub fn new(url: &str, username: Option<String>, password: Option<String>) -> Self {
        Self {
            program: "svn".to_string(),
            url: url.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    fn command(&self, path: &str) -> CommandLine {
        let mut cmd = CommandLine::new(self.program.clone()).args(["ls", "--non-interactive"]);
        if let Some(user) = &self.username {
            cmd = cmd.arg("--username").arg(user);
        }
        // The password itself goes over stdin, never argv.
        if self.password.is_some() {
            cmd = cmd.arg("--password-from-stdin");
        }
        let path = path.trim_matches('/');
        if path.is_empty() {
            cmd.arg(self.url.clone())
        } else {
            cmd.arg(format!("{}/{}", self.url, path))
        }
    }
}

#[async_trait]
impl SourceBrowser for SvnBrowser {
    async fn list(&self, path: &str) -> Result<Vec<String>, MigrationError> {
        let cmd = self.command(path);
        // Keep the password out of error messages.
        let shown = format!("svn ls {}", cmd.args.last().map(String::as_str).unwrap_or(""));
        let stdin = if self.password.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MigrationError::SpawnFailed {
                command: shown.clone(),
                source,
            })?;
        if let Some(password) = &self.password
            && let Some(mut pipe) = child.stdin.take()
        {
            // A child that exits before reading is reported by its exit status.
            if let Err(e) = pipe.write_all(password.as_bytes()).await {
                tracing::debug!(command = %shown, error = %e, "could not write svn password");
            }
            drop(pipe);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| MigrationError::SpawnFailed {
                command: shown.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(command = %shown, stderr = %stderr.trim(), "svn listing failed");
            return Err(MigrationError::ProcessFailure {
                command: shown,
                code: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn directories(entries: Vec<String>) -> Vec<String> {
    entries
        .into_iter()
        .filter_map(|e| e.strip_suffix('/').map(str::to_string))
        .collect()
}

/// Classify a repository as flat or modular.
pub async fn repository_structure(
    browser: &dyn SourceBrowser,
    repo: &str,
) -> Result<RepositoryStructure, MigrationError> {
    let repo = repo.trim_matches('/');
    let root = directories(browser.list(repo).await?);
    if root.iter().any(|d| d == "trunk") {
        return Ok(RepositoryStructure {
            name: repo.to_string(),
            flat: true,
            modules: Vec::new(),
        });
    }

    let mut modules = Vec::with_capacity(root.len());
    for name in root {
        let path = format!("{}/{}", repo, name);
        let children = directories(browser.list(&path).await?);
        let sub_modules = if children.iter().any(|d| d == "trunk") {
            Vec::new()
        } else {
            children
                .into_iter()
                .map(|child| SvnModule {
                    path: format!("{}/{}", path, child),
                    name: child,
                    sub_modules: Vec::new(),
                })
                .collect()
        };
        modules.push(SvnModule {
            name,
            path,
            sub_modules,
        });
    }
    Ok(RepositoryStructure {
        name: repo.to_string(),
        flat: false,
        modules,
    })
}
