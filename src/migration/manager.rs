//! Migration orchestrator.
//!
//! Drives one job through PROJECT_CREATION, SOURCE_CHECKOUT, HISTORY_CLEAN
//! and DESTINATION_PUSH, in that order. Each step is bracketed by a history
//! record. The first error aborts the remaining steps: the open record is
//! marked FAILED, then the job. Nothing already done is rolled back.
//!
//! SOURCE_CHECKOUT mirror-clones the freshly created project before importing.
//! That clone only checks that the destination answers and is empty; BFG, gc
//! and the push all work on the `git svn` checkout.
//!
//! Status writes are conditional on the status the job had before. A job that
//! `reconcile` marked FAILED mid-run stays FAILED when the run ends.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use super::gitlab::ProjectProvisioner;
use super::models::{Migration, MigrationHistory, Status, Step, is_relative_path};
use super::push::{DestinationPusher, GitCredentials, PushRequest};
use super::recorder::StepRecorder;
use super::runner::{CommandLine, CommandRunner};
use super::store::JobStore;
use crate::errors::MigrationError;

/// Engine-wide settings shared by every job.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub svn_url: String,
    /// Passed to `git svn clone --username` when set.
    pub svn_username: Option<String>,
    pub gitlab_url: String,
    /// Parent of every job's scratch root.
    pub work_dir: PathBuf,
    pub clean_pattern: String,
    /// Argv prefix of the history rewriter.
    pub bfg: Vec<String>,
    pub git: String,
    pub remotes: Vec<String>,
    pub default_branch: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            svn_url: String::new(),
            svn_username: None,
            gitlab_url: String::new(),
            work_dir: std::env::temp_dir(),
            clean_pattern: "*.zip".to_string(),
            bfg: vec!["bfg".to_string()],
            git: "git".to_string(),
            remotes: vec!["origin".to_string(), "gitlab".to_string()],
            default_branch: "master".to_string(),
        }
    }
}

/// Filesystem locations owned by one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkLayout {
    /// `<work_dir>/<id>`, recreated on every run.
    pub root: PathBuf,
    /// Working tree produced by `git svn clone`.
    pub checkout_dir: PathBuf,
    pub git_dir: PathBuf,
    /// Mirror clone of the empty destination project. Cloning it proves the
    /// new project is reachable with the configured transport before the
    /// long `git svn` import starts; no later step reads it. History is
    /// rewritten and pushed from `git_dir`.
    pub mirror_dir: PathBuf,
}

impl WorkLayout {
    pub fn for_migration(work_dir: &Path, migration: &Migration) -> Result<Self, MigrationError> {
        for (field, value) in [
            ("svn_group", &migration.svn_group),
            ("svn_project", &migration.svn_project),
        ] {
            if !is_relative_path(value) {
                return Err(MigrationError::InvalidLayout(format!(
                    "{} '{}' is not a relative path",
                    field, value
                )));
            }
        }
        let root = work_dir.join(migration.id.to_string());
        let checkout_dir = root.join(&migration.svn_group);
        Ok(Self {
            git_dir: checkout_dir.join(".git"),
            mirror_dir: root.join(format!("{}.git", migration.svn_project)),
            checkout_dir,
            root,
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub struct MigrationManager {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn CommandRunner>,
    provisioner: Arc<dyn ProjectProvisioner>,
    pusher: Arc<dyn DestinationPusher>,
    settings: MigrationSettings,
    /// Ids of jobs currently executing in this process.
    running: Arc<Mutex<HashSet<i64>>>,
}

impl MigrationManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn CommandRunner>,
        provisioner: Arc<dyn ProjectProvisioner>,
        pusher: Arc<dyn DestinationPusher>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            store,
            runner,
            provisioner,
            pusher,
            settings,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    pub async fn is_running(&self, id: i64) -> bool {
        self.running.lock().await.contains(&id)
    }

    /// Start a job in the background and return immediately. Progress is
    /// observable only through the job store.
    pub async fn start_migration(self: &Arc<Self>, id: i64) -> Result<(), MigrationError> {
        if !self.running.lock().await.insert(id) {
            return Err(MigrationError::AlreadyRunning { id });
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.run_migration(id).await;
            manager.running.lock().await.remove(&id);
            match result {
                Ok(status) => tracing::info!(migration_id = id, status = %status, "migration finished"),
                Err(e) => tracing::error!(migration_id = id, error = %e, "migration could not start"),
            }
        });
        Ok(())
    }

    /// Run a job to completion on the current task.
    ///
    /// Returns the job's final status. An `Err` means the job never reached
    /// RUNNING (unknown id, job not PENDING) or its status could not be
    /// persisted; step failures are reported as `Ok(Status::Failed)`.
    pub async fn run_migration(&self, id: i64) -> Result<Status, MigrationError> {
        let mut migration = self
            .store
            .find_migration(id)
            .await
            .map_err(MigrationError::Store)?
            .ok_or(MigrationError::NotFound { id })?;

        self.transition(&mut migration, Status::Running).await?;
        tracing::info!(
            migration_id = id,
            svn_group = %migration.svn_group,
            gitlab_group = %migration.gitlab_group,
            "migration started"
        );

        let mut execution = Execution {
            manager: self,
            recorder: StepRecorder::new(Arc::clone(&self.store)),
            open: None,
        };
        let result = match execution.run_steps(&migration).await {
            Ok(()) => self.transition(&mut migration, Status::Done).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(Status::Done),
            Err(e) => {
                let step = execution.open.as_ref().map(|r| r.step.as_str()).unwrap_or("-");
                tracing::error!(migration_id = id, step, error = %e, "migration failed");
                execution.abort().await;
                self.transition(&mut migration, Status::Failed).await?;
                Ok(Status::Failed)
            }
        }
    }

    /// Persist a status change. The in-memory job is only updated once the
    /// store accepted it.
    async fn transition(&self, migration: &mut Migration, to: Status) -> Result<(), MigrationError> {
        if !migration.status.can_transition_to(to) {
            return Err(MigrationError::InvalidTransition {
                from: migration.status,
                to,
            });
        }
        let mut next = migration.clone();
        next.status = to;
        self.store
            .save_migration(&next)
            .await
            .map_err(MigrationError::Store)?;
        *migration = next;
        Ok(())
    }

    fn destination_url(&self, migration: &Migration) -> String {
        format!(
            "{}/{}/{}.git",
            self.settings.gitlab_url.trim_end_matches('/'),
            migration.gitlab_group,
            migration.svn_project
        )
    }

    fn git(&self) -> CommandLine {
        CommandLine::new(self.settings.git.clone())
    }
}

/// State of one run: the recorder and the step record currently open.
struct Execution<'a> {
    manager: &'a MigrationManager,
    recorder: StepRecorder,
    open: Option<MigrationHistory>,
}

impl Execution<'_> {
    async fn run_steps(&mut self, migration: &Migration) -> Result<(), MigrationError> {
        let settings = &self.manager.settings;
        let layout = WorkLayout::for_migration(&settings.work_dir, migration)?;
        let destination = self.manager.destination_url(migration);

        self.create_project(migration).await?;
        self.checkout(migration, &layout, &destination).await?;
        self.clean(migration, &layout).await?;
        self.push(migration, &layout, &destination).await?;
        Ok(())
    }

    async fn begin(&mut self, migration: &Migration, step: Step, data: String) -> Result<(), MigrationError> {
        let record = self.recorder.start_step(migration, step, Some(data)).await?;
        self.open = Some(record);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), MigrationError> {
        if let Some(record) = self.open.as_mut() {
            self.recorder.end_step(record).await?;
        }
        self.open = None;
        Ok(())
    }

    /// Mark the open record FAILED, if any.
    async fn abort(&mut self) {
        if let Some(mut record) = self.open.take()
            && let Err(e) = self.recorder.fail_step(&mut record).await
        {
            tracing::error!(
                migration_id = record.migration_id,
                step = %record.step,
                error = %e,
                "failed to mark step FAILED"
            );
        }
    }

    async fn create_project(&mut self, migration: &Migration) -> Result<(), MigrationError> {
        let manager = self.manager;
        let data = format!(
            "{}/{}",
            manager.settings.gitlab_url.trim_end_matches('/'),
            migration.gitlab_group
        );
        self.begin(migration, Step::ProjectCreation, data).await?;

        let provisioner = &manager.provisioner;
        let group = provisioner.resolve_group(&migration.gitlab_group).await?;
        let project = provisioner.create_project(&group, &migration.svn_project).await?;
        tracing::info!(migration_id = migration.id, project_id = project.id, "destination project ready");

        self.finish().await
    }

    async fn checkout(
        &mut self,
        migration: &Migration,
        layout: &WorkLayout,
        destination: &str,
    ) -> Result<(), MigrationError> {
        let manager = self.manager;
        let settings = &manager.settings;
        let source = format!("{}/{}", settings.svn_url.trim_end_matches('/'), migration.svn_group);
        self.begin(migration, Step::SourceCheckout, source.clone()).await?;

        if tokio::fs::try_exists(&layout.root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&layout.root)
                .await
                .with_context(|| format!("Failed to clear scratch root {}", layout.root.display()))?;
        }
        tokio::fs::create_dir_all(&layout.root)
            .await
            .with_context(|| format!("Failed to create scratch root {}", layout.root.display()))?;

        let mirror = manager
            .git()
            .args(["clone", "--mirror"])
            .arg(destination)
            .arg(path_arg(&layout.mirror_dir));
        manager.runner.run_checked(&layout.root, &mirror).await?;

        let project = &migration.svn_project;
        let mut clone = manager.git().args([
            "svn".to_string(),
            "clone".to_string(),
            format!("--trunk={}/trunk", project),
            format!("--branches={}/branches", project),
            format!("--tags={}/tags", project),
        ]);
        if let Some(user) = &settings.svn_username {
            clone = clone.arg("--username").arg(user);
        }
        let clone = clone.arg(source).arg(migration.svn_group.clone());
        manager.runner.run_checked(&layout.root, &clone).await?;

        self.finish().await
    }

    async fn clean(&mut self, migration: &Migration, layout: &WorkLayout) -> Result<(), MigrationError> {
        let manager = self.manager;
        let pattern = manager.settings.clean_pattern.clone();
        self.begin(migration, Step::HistoryClean, pattern.clone()).await?;

        let bfg = CommandLine::from_argv(&manager.settings.bfg)
            .context("History rewriter command is empty")?
            .args(["--delete-files".to_string(), pattern, "--no-blob-protection".to_string()])
            .arg(path_arg(&layout.git_dir));
        manager.runner.run_checked(&layout.checkout_dir, &bfg).await?;

        let expire = manager.git().args(["reflog", "expire", "--expire=now", "--all"]);
        manager.runner.run_checked(&layout.checkout_dir, &expire).await?;
        let gc = manager.git().args(["gc", "--prune=now", "--aggressive"]);
        manager.runner.run_checked(&layout.checkout_dir, &gc).await?;

        self.finish().await
    }

    async fn push(
        &mut self,
        migration: &Migration,
        layout: &WorkLayout,
        destination: &str,
    ) -> Result<(), MigrationError> {
        let manager = self.manager;
        let settings = &manager.settings;
        let data = format!("trunk -> {}", settings.default_branch);
        self.begin(migration, Step::DestinationPush, data).await?;

        let credentials = (!migration.user.is_empty()).then(|| GitCredentials {
            username: migration.user.clone(),
            password: migration.password.clone(),
        });
        let outcome = manager
            .pusher
            .push(PushRequest {
                repo_dir: layout.checkout_dir.clone(),
                url: destination.to_string(),
                remotes: settings.remotes.clone(),
                default_branch: settings.default_branch.clone(),
                credentials,
            })
            .await?;
        tracing::info!(
            migration_id = migration.id,
            remote = %outcome.remote,
            refs = outcome.refspecs.len(),
            "history pushed"
        );

        self.finish().await
    }
}
