//! Migration engine: Subversion repository → GitLab project.
//!
//! ## Overview
//!
//! A migration job names a Subversion repository path, the project directory
//! holding its trunk/branches/tags, a destination GitLab group and the
//! credentials to push with. The engine runs the job as four audited steps and
//! records each one in SQLite, so an operator can see exactly where a job
//! stopped.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! └──────────┘ <─────── │    └─ api.rs  (route handlers, AppState)         │
//!                       │         │                                        │
//!                       │         │ MigrationManager::start_migration()    │
//!                       │         v                                        │
//!                       │  manager.rs  (MigrationManager, WorkLayout)      │
//!                       │     │        │            │             │        │
//!                       │     v        v            v             v        │
//!                       │  gitlab.rs  runner.rs   push.rs    recorder.rs   │
//!                       │  (REST)     (git, bfg)  (libgit2)  (history)     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | `Migration`, `MigrationHistory`, `Status`, `Step`          |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)        |
//! | `store`    | `JobStore` trait the orchestrator persists through         |
//! | `browser`  | `svn ls` based repository browsing (flat vs modules)       |
//!
//! ## Step Sequence
//!
//! 1. `PROJECT_CREATION`: resolve the destination group, create the project.
//! 2. `SOURCE_CHECKOUT`: recreate `<work_dir>/<id>`, mirror-clone the empty
//!    destination, then `git svn clone` the source layout.
//! 3. `HISTORY_CLEAN`: BFG deletes blobs matching the configured pattern,
//!    then reflogs are expired and the repository is aggressively collected.
//! 4. `DESTINATION_PUSH`: register the remote aliases and push branches and
//!    tags, with `trunk` becoming the default branch.
//!
//! The first failure marks the open step and the job FAILED and stops.

pub mod api;
pub mod browser;
pub mod db;
pub mod gitlab;
pub mod manager;
pub mod models;
pub mod push;
pub mod recorder;
pub mod runner;
pub mod server;
pub mod store;
