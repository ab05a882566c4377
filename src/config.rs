//! Layered configuration for svnlift.
//!
//! Settings are read from `.svnlift/svnlift.toml` (optional), then overridden
//! by `SVNLIFT_*` environment variables (a `.env` file is loaded first by the
//! binary), then by command-line flags.
//!
//! ```toml
//! [svn]
//! url = "https://svn.example.com/svn"
//! username = "reader"
//!
//! [gitlab]
//! url = "https://gitlab.example.com"
//! token = "glpat-..."
//!
//! [workspace]
//! root = "/var/tmp/svnlift"
//!
//! [cleaning]
//! pattern = "*.zip"
//! bfg = ["java", "-jar", "/opt/bfg.jar"]
//!
//! [push]
//! remotes = ["origin", "gitlab"]
//! default_branch = "master"
//!
//! [commands]
//! git = "git"
//! timeout_secs = 3600
//!
//! [server]
//! port = 3141
//! db_path = ".svnlift/svnlift.db"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::migration::manager::MigrationSettings;

pub const DEFAULT_CONFIG_PATH: &str = ".svnlift/svnlift.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SvnConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Only used for browsing; checkouts rely on the svn credential cache.
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitLabConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_work_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_work_root(),
        }
    }
}

fn default_work_root() -> PathBuf {
    std::env::temp_dir()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningConfig {
    #[serde(default = "default_clean_pattern")]
    pub pattern: String,
    #[serde(default = "default_bfg")]
    pub bfg: Vec<String>,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            pattern: default_clean_pattern(),
            bfg: default_bfg(),
        }
    }
}

fn default_clean_pattern() -> String {
    "*.zip".to_string()
}

fn default_bfg() -> Vec<String> {
    vec!["bfg".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_remotes")]
    pub remotes: Vec<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            remotes: default_remotes(),
            default_branch: default_branch(),
        }
    }
}

fn default_remotes() -> Vec<String> {
    vec!["origin".to_string(), "gitlab".to_string()]
}

fn default_branch() -> String {
    "master".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_git")]
    pub git: String,
    /// Per-command timeout. Absent means wait forever.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            git: default_git(),
            timeout_secs: None,
        }
    }
}

fn default_git() -> String {
    "git".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".svnlift/svnlift.db")
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SvnliftConfig {
    #[serde(default)]
    pub svn: SvnConfig,
    #[serde(default)]
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Values supplied on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub svn_url: Option<String>,
    pub gitlab_url: Option<String>,
    pub gitlab_token: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub clean_pattern: Option<String>,
    pub db_path: Option<PathBuf>,
    pub port: Option<u16>,
}

impl SvnliftConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse svnlift.toml")
    }

    /// Load `explicit` if given (it must exist), otherwise the default path
    /// when present, otherwise built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Full resolution: file, then process environment, then CLI.
    pub fn resolve(explicit: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = Self::load_or_default(explicit)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Apply `SVNLIFT_*` variables through `lookup`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = get("SVNLIFT_SVN_URL") {
            self.svn.url = v;
        }
        if let Some(v) = get("SVNLIFT_SVN_USERNAME") {
            self.svn.username = Some(v);
        }
        if let Some(v) = get("SVNLIFT_SVN_PASSWORD") {
            self.svn.password = Some(v);
        }
        if let Some(v) = get("SVNLIFT_GITLAB_URL") {
            self.gitlab.url = v;
        }
        if let Some(v) = get("SVNLIFT_GITLAB_TOKEN") {
            self.gitlab.token = v;
        }
        if let Some(v) = get("SVNLIFT_WORK_DIR") {
            self.workspace.root = PathBuf::from(v);
        }
        if let Some(v) = get("SVNLIFT_CLEAN_PATTERN") {
            self.cleaning.pattern = v;
        }
        if let Some(v) = get("SVNLIFT_DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(v) = &cli.svn_url {
            self.svn.url = v.clone();
        }
        if let Some(v) = &cli.gitlab_url {
            self.gitlab.url = v.clone();
        }
        if let Some(v) = &cli.gitlab_token {
            self.gitlab.token = v.clone();
        }
        if let Some(v) = &cli.work_dir {
            self.workspace.root = v.clone();
        }
        if let Some(v) = &cli.clean_pattern {
            self.cleaning.pattern = v.clone();
        }
        if let Some(v) = &cli.db_path {
            self.server.db_path = v.clone();
        }
        if let Some(v) = cli.port {
            self.server.port = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cleaning.bfg.is_empty() {
            anyhow::bail!("[cleaning] bfg must name at least the program to run");
        }
        if self.cleaning.pattern.trim().is_empty() {
            anyhow::bail!("[cleaning] pattern must not be empty");
        }
        if self.push.remotes.is_empty() {
            anyhow::bail!("[push] remotes must list at least one alias");
        }
        if self.push.default_branch.trim().is_empty() {
            anyhow::bail!("[push] default_branch must not be empty");
        }
        if self.commands.timeout_secs == Some(0) {
            anyhow::bail!("[commands] timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.commands.timeout_secs.map(Duration::from_secs)
    }

    /// Engine settings derived from this configuration.
    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            svn_url: self.svn.url.clone(),
            svn_username: self.svn.username.clone(),
            gitlab_url: self.gitlab.url.clone(),
            work_dir: self.workspace.root.clone(),
            clean_pattern: self.cleaning.pattern.clone(),
            bfg: self.cleaning.bfg.clone(),
            git: self.commands.git.clone(),
            remotes: self.push.remotes.clone(),
            default_branch: self.push.default_branch.clone(),
        }
    }
}
