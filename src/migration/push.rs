//! Destination push.
//!
//! The cleaned working repository is pushed to the destination with libgit2.
//! Each configured remote alias is pointed at the destination URL (added when
//! missing, re-targeted when present) and the push goes through the first
//! alias. Source-control branches and tags imported by `git svn` live under
//! `refs/remotes/origin/`; they are mapped onto ordinary branch and tag names
//! on the destination, with `trunk` becoming the default branch.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use git2::{Cred, PushOptions, ReferenceType, RemoteCallbacks, Repository};

use crate::errors::MigrationError;

const SVN_REMOTE_PREFIX: &str = "refs/remotes/origin/";

#[derive(Clone)]
pub struct GitCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for GitCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Directory holding the `.git` of the cleaned working repository.
    pub repo_dir: PathBuf,
    pub url: String,
    pub remotes: Vec<String>,
    pub default_branch: String,
    pub credentials: Option<GitCredentials>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub remote: String,
    pub refspecs: Vec<String>,
}

/// Abstraction over the destination push for testability.
/// Real implementation: `Git2Pusher`.
#[async_trait]
pub trait DestinationPusher: Send + Sync {
    async fn push(&self, request: PushRequest) -> Result<PushOutcome, MigrationError>;
}

/// Destination name for a local ref, or `None` when it should not be pushed.
pub fn destination_ref(name: &str, default_branch: &str) -> Option<String> {
    if name.contains('@') {
        // git-svn peg revisions, e.g. `tags/v1@123`
        return None;
    }
    if name == "refs/heads/master" {
        return Some(format!("refs/heads/{}", default_branch));
    }
    if name.starts_with("refs/heads/") || name.starts_with("refs/tags/") {
        return Some(name.to_string());
    }
    let rest = name.strip_prefix(SVN_REMOTE_PREFIX)?;
    if rest == "trunk" {
        Some(format!("refs/heads/{}", default_branch))
    } else if let Some(tag) = rest.strip_prefix("tags/") {
        (!tag.is_empty()).then(|| format!("refs/tags/{}", tag))
    } else if rest.is_empty() || rest == "HEAD" {
        None
    } else {
        Some(format!("refs/heads/{}", rest))
    }
}

/// Build push refspecs for the given local refs.
///
/// When two refs map to the same destination, imported trunk wins the default
/// branch; local `master` only stands in for it when there is no trunk, since
/// `git svn clone` points `master` at whichever ref was committed last. Other
/// local branches and tags win over imported ones.
pub fn plan_refspecs<I, S>(names: I, default_branch: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let trunk = format!("{}trunk", SVN_REMOTE_PREFIX);
    let mut names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
    names.sort_by_key(|n| {
        let rank = if *n == trunk {
            0
        } else if n.starts_with(SVN_REMOTE_PREFIX) {
            2
        } else {
            1
        };
        (rank, n.clone())
    });

    let mut seen = HashSet::new();
    names
        .iter()
        .filter_map(|src| {
            let dst = destination_ref(src, default_branch)?;
            seen.insert(dst.clone()).then(|| format!("{}:{}", src, dst))
        })
        .collect()
}

pub struct Git2Pusher;

#[async_trait]
impl DestinationPusher for Git2Pusher {
    async fn push(&self, request: PushRequest) -> Result<PushOutcome, MigrationError> {
        tokio::task::spawn_blocking(move || push_blocking(&request))
            .await
            .context("push task panicked")?
    }
}

fn transport(url: &str, message: impl Into<String>) -> MigrationError {
    MigrationError::Transport {
        url: url.to_string(),
        message: message.into(),
    }
}

fn push_blocking(request: &PushRequest) -> Result<PushOutcome, MigrationError> {
    let url = request.url.as_str();
    let repo = Repository::open(&request.repo_dir)
        .with_context(|| format!("Failed to open repository at {}", request.repo_dir.display()))?;

    let primary = request
        .remotes
        .first()
        .ok_or_else(|| transport(url, "no remote alias configured"))?;
    for alias in &request.remotes {
        let configured = if repo.find_remote(alias).is_ok() {
            repo.remote_set_url(alias, url)
        } else {
            repo.remote(alias, url).map(|_| ())
        };
        configured.with_context(|| format!("Failed to configure remote '{}'", alias))?;
    }

    let mut names = Vec::new();
    for reference in repo.references().context("Failed to list references")? {
        let reference = reference.context("Failed to read reference")?;
        if reference.kind() != Some(ReferenceType::Direct) {
            continue;
        }
        if let Some(name) = reference.name() {
            names.push(name.to_string());
        }
    }
    let refspecs = plan_refspecs(&names, &request.default_branch);
    if refspecs.is_empty() {
        return Err(transport(url, "repository has no branches or tags to push"));
    }

    let mut remote = repo
        .find_remote(primary)
        .with_context(|| format!("Failed to load remote '{}'", primary))?;
    let mut rejected = Vec::new();
    {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(creds) = request.credentials.clone() {
            let mut attempts = 0;
            callbacks.credentials(move |_url, _username, _allowed| {
                attempts += 1;
                if attempts > 1 {
                    return Err(git2::Error::from_str("authentication rejected"));
                }
                Cred::userpass_plaintext(&creds.username, &creds.password)
            });
        }
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                rejected.push(format!("{} ({})", refname, message));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote
            .push(&refspecs, Some(&mut options))
            .map_err(|e| transport(url, e.message()))?;
    }
    if !rejected.is_empty() {
        return Err(transport(url, format!("rejected: {}", rejected.join(", "))));
    }

    tracing::info!(remote = %primary, url, refs = refspecs.len(), "pushed to destination");
    Ok(PushOutcome {
        remote: primary.clone(),
        refspecs,
    })
}
