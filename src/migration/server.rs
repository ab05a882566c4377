use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::browser::SvnBrowser;
use super::db::{DbHandle, MigrationDb};
use super::gitlab::GitLabClient;
use super::manager::MigrationManager;
use super::push::Git2Pusher;
use super::runner::ProcessRunner;
use crate::config::SvnliftConfig;

pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(".svnlift/svnlift.db"),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Open (creating if needed) the job database.
pub fn open_db(db_path: &std::path::Path) -> Result<DbHandle> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = MigrationDb::new(db_path).context("Failed to initialize migration database")?;
    Ok(DbHandle::new(db))
}

/// Wire the production collaborators around `db`.
pub fn build_manager(config: &SvnliftConfig, db: &DbHandle) -> Result<MigrationManager> {
    let provisioner = GitLabClient::new(&config.gitlab.url, config.gitlab.token.clone())
        .context("Failed to configure GitLab client")?;
    let runner = ProcessRunner::default().with_timeout(config.command_timeout());
    Ok(MigrationManager::new(
        Arc::new(db.clone()),
        Arc::new(runner),
        Arc::new(provisioner),
        Arc::new(Git2Pusher),
        config.migration_settings(),
    ))
}

pub fn build_browser(config: &SvnliftConfig) -> SvnBrowser {
    SvnBrowser::new(
        &config.svn.url,
        config.svn.username.clone(),
        config.svn.password.clone(),
    )
}

pub async fn start_server(config: &SvnliftConfig, server: ServerConfig) -> Result<()> {
    let db = open_db(&server.db_path)?;

    // Nothing can be executing in a fresh process.
    let reconciled = db.call(|db| db.fail_interrupted()).await?;
    if reconciled > 0 {
        tracing::warn!(count = reconciled, "marked interrupted records FAILED");
    }

    let state = Arc::new(AppState {
        manager: Arc::new(build_manager(config, &db)?),
        browser: Arc::new(build_browser(config)),
        db,
    });

    let mut app = build_router(state);

    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "svnlift server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::models::{NewHistory, NewMigration, Status, Step};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config() -> SvnliftConfig {
        let mut config = SvnliftConfig::default();
        config.gitlab.url = "http://127.0.0.1:1".into();
        config.svn.url = "file:///nonexistent".into();
        config
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let db = DbHandle::new(MigrationDb::new_in_memory().unwrap());
        let config = test_config();
        let state = Arc::new(AppState {
            manager: Arc::new(build_manager(&config, &db).unwrap()),
            browser: Arc::new(build_browser(&config)),
            db,
        });
        let app = build_router(state);

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[test]
    fn test_build_manager_rejects_bad_gitlab_url() {
        let mut config = test_config();
        config.gitlab.url = "not a url".into();
        let db = DbHandle::new(MigrationDb::new_in_memory().unwrap());
        assert!(build_manager(&config, &db).is_err());
    }

    #[tokio::test]
    async fn test_open_db_creates_parent_and_reconciles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/svnlift.db");
        let db = open_db(&path).unwrap();
        assert!(path.exists());

        let job = {
            let guard = db.lock_sync().unwrap();
            let mut job = guard
                .create_migration(&NewMigration {
                    svn_group: "legacy/app".into(),
                    svn_project: "app".into(),
                    gitlab_group: "newhost/app".into(),
                    user: "migrator".into(),
                    password: String::new(),
                })
                .unwrap();
            job.status = Status::Running;
            guard.save_migration(&job).unwrap();
            guard
                .insert_history(&NewHistory {
                    migration_id: job.id,
                    step: Step::SourceCheckout,
                    date: chrono::Utc::now(),
                    data: None,
                })
                .unwrap();
            job
        };
        drop(db);

        let db = open_db(&path).unwrap();
        let count = db.call(|db| db.fail_interrupted()).await.unwrap();
        assert_eq!(count, 1);
        let guard = db.lock_sync().unwrap();
        assert_eq!(guard.get_migration(job.id).unwrap().unwrap().status, Status::Failed);
        assert_eq!(guard.list_history(job.id).unwrap()[0].status, Status::Failed);
    }
}
