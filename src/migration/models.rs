use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by migrations and their step records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Forward-only transitions: PENDING -> RUNNING -> {DONE, FAILED}.
    pub fn can_transition_to(&self, to: Status) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running) | (Self::Running, Self::Done) | (Self::Running, Self::Failed)
        )
    }
}

impl Status {
    /// Statuses a stored job may hold when it is overwritten with `self`.
    /// Saving FAILED over FAILED is accepted so a job reconciled mid-run can
    /// still be closed by its executor.
    pub fn saved_over(&self) -> &'static [Status] {
        match self {
            Self::Pending => &[],
            Self::Running => &[Self::Pending],
            Self::Done => &[Self::Running],
            Self::Failed => &[Self::Running, Self::Failed],
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// The four fixed phases of a migration, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    ProjectCreation,
    SourceCheckout,
    HistoryClean,
    DestinationPush,
}

impl Step {
    pub const ALL: [Step; 4] = [
        Step::ProjectCreation,
        Step::SourceCheckout,
        Step::HistoryClean,
        Step::DestinationPush,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreation => "PROJECT_CREATION",
            Self::SourceCheckout => "SOURCE_CHECKOUT",
            Self::HistoryClean => "HISTORY_CLEAN",
            Self::DestinationPush => "DESTINATION_PUSH",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROJECT_CREATION" => Ok(Self::ProjectCreation),
            "SOURCE_CHECKOUT" => Ok(Self::SourceCheckout),
            "HISTORY_CLEAN" => Ok(Self::HistoryClean),
            "DESTINATION_PUSH" => Ok(Self::DestinationPush),
            _ => Err(format!("Invalid step: {}", s)),
        }
    }
}

/// One migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: i64,
    /// Repository path under the Subversion root, e.g. `legacy/app`.
    pub svn_group: String,
    /// Project directory inside the repository holding trunk/branches/tags.
    pub svn_project: String,
    /// Destination group full path on GitLab.
    pub gitlab_group: String,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub status: Status,
    pub created_at: String,
    pub updated_at: String,
}

/// Audit record of one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationHistory {
    pub id: i64,
    pub migration_id: i64,
    pub step: Step,
    pub status: Status,
    pub date: DateTime<Utc>,
    pub data: Option<String>,
}

/// A history record that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewHistory {
    pub migration_id: i64,
    pub step: Step,
    pub date: DateTime<Utc>,
    pub data: Option<String>,
}

/// Job submission payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMigration {
    pub svn_group: String,
    pub svn_project: String,
    pub gitlab_group: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl NewMigration {
    /// Reject submissions whose names would escape the job's scratch root.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("svn_group", &self.svn_group),
            ("svn_project", &self.svn_project),
            ("gitlab_group", &self.gitlab_group),
            ("user", &self.user),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} must not be empty", field));
            }
        }
        for (field, value) in [
            ("svn_group", &self.svn_group),
            ("svn_project", &self.svn_project),
        ] {
            if !is_relative_path(value) {
                return Err(format!(
                    "{} must be a relative path without '..' or a leading '-': {}",
                    field, value
                ));
            }
        }
        Ok(())
    }
}

/// True for `a/b/c` style paths with no empty, `.` or `..` segments.
///
/// Segments may not start with `-`; the path ends up as a positional
/// argument of `git svn clone` and must not parse as an option.
pub fn is_relative_path(value: &str) -> bool {
    !value.starts_with('/')
        && !value.contains('\\')
        && value.split('/').all(|segment| {
            !segment.is_empty() && segment != "." && segment != ".." && !segment.starts_with('-')
        })
}

/// A migration together with its step records.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationDetail {
    #[serde(flatten)]
    pub migration: Migration,
    pub history: Vec<MigrationHistory>,
}
