use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::browser::{RepositoryStructure, SourceBrowser, repository_structure};
use super::db::DbHandle;
use super::manager::MigrationManager;
use super::models::{Migration, MigrationHistory, NewMigration, Status};
use crate::errors::MigrationError;

pub struct AppState {
    pub db: DbHandle,
    pub manager: Arc<MigrationManager>,
    pub browser: Arc<dyn SourceBrowser>,
}

pub type SharedState = Arc<AppState>;

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// The source repository or another upstream system failed.
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<MigrationError> for ApiError {
    fn from(err: MigrationError) -> Self {
        let msg = err.to_string();
        match err {
            MigrationError::NotFound { .. } => ApiError::NotFound(msg),
            MigrationError::AlreadyRunning { .. } | MigrationError::InvalidTransition { .. } => {
                ApiError::Conflict(msg)
            }
            MigrationError::InvalidLayout(_) => ApiError::BadRequest(msg),
            MigrationError::ProcessFailure { .. }
            | MigrationError::SpawnFailed { .. }
            | MigrationError::Timeout { .. }
            | MigrationError::RemoteApi { .. }
            | MigrationError::Transport { .. } => ApiError::Upstream(msg),
            MigrationError::Store(_) | MigrationError::Other(_) => ApiError::Internal(msg),
        }
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", e))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/migrations", get(list_migrations).post(create_migration))
        .route("/api/migrations/{id}", get(get_migration))
        .route("/api/migrations/{id}/history", get(get_history))
        .route("/api/migrations/{id}/start", post(start_migration))
        .route("/api/svn/{*repo}", get(browse_repository))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_migrations(State(state): State<SharedState>) -> Result<Json<Vec<Migration>>, ApiError> {
    let migrations = state
        .db
        .call(|db| db.list_migrations())
        .await
        .map_err(internal)?;
    Ok(Json(migrations))
}

/// Create a PENDING job and dispatch it.
async fn create_migration(
    State(state): State<SharedState>,
    Json(req): Json<NewMigration>,
) -> Result<(StatusCode, Json<Migration>), ApiError> {
    req.validate().map_err(ApiError::BadRequest)?;
    let migration = state
        .db
        .call(move |db| db.create_migration(&req))
        .await
        .map_err(internal)?;
    state.manager.start_migration(migration.id).await?;
    tracing::info!(migration_id = migration.id, "migration submitted");
    Ok((StatusCode::CREATED, Json(migration)))
}

async fn find_migration(state: &SharedState, id: i64) -> Result<Migration, ApiError> {
    state
        .db
        .call(move |db| db.get_migration(id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::from(MigrationError::NotFound { id }))
}

async fn get_migration(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Migration>, ApiError> {
    Ok(Json(find_migration(&state, id).await?))
}

async fn get_history(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<MigrationHistory>>, ApiError> {
    find_migration(&state, id).await?;
    let history = state
        .db
        .call(move |db| db.list_history(id))
        .await
        .map_err(internal)?;
    Ok(Json(history))
}

async fn start_migration(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let migration = find_migration(&state, id).await?;
    if migration.status != Status::Pending {
        return Err(ApiError::Conflict(format!(
            "Migration {} is {}, only PENDING jobs can be started",
            id, migration.status
        )));
    }
    state.manager.start_migration(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"id": id, "accepted": true})),
    ))
}

async fn browse_repository(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
) -> Result<Json<RepositoryStructure>, ApiError> {
    let structure = repository_structure(state.browser.as_ref(), &repo).await?;
    Ok(Json(structure))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::db::MigrationDb;
    use crate::migration::gitlab::{GroupHandle, ProjectHandle, ProjectProvisioner};
    use crate::migration::manager::MigrationSettings;
    use crate::migration::push::{DestinationPusher, PushOutcome, PushRequest};
    use crate::migration::runner::{CommandLine, CommandRunner};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct NoopRunner;

    #[async_trait]
    impl CommandRunner for NoopRunner {
        async fn run(&self, _dir: &std::path::Path, _command: &CommandLine) -> Result<Option<i32>, MigrationError> {
            Ok(Some(0))
        }
    }

    /// Every project already exists, so jobs fail at PROJECT_CREATION.
    struct TakenProvisioner;

    #[async_trait]
    impl ProjectProvisioner for TakenProvisioner {
        async fn resolve_group(&self, group_path: &str) -> Result<GroupHandle, MigrationError> {
            Ok(GroupHandle {
                id: 1,
                full_path: group_path.to_string(),
            })
        }

        async fn create_project(&self, _group: &GroupHandle, _name: &str) -> Result<ProjectHandle, MigrationError> {
            Err(MigrationError::remote("create project", Some(400), "has already been taken"))
        }
    }

    struct NoopPusher;

    #[async_trait]
    impl DestinationPusher for NoopPusher {
        async fn push(&self, request: PushRequest) -> Result<PushOutcome, MigrationError> {
            Ok(PushOutcome {
                remote: request.remotes[0].clone(),
                refspecs: Vec::new(),
            })
        }
    }

    struct MapBrowser(HashMap<&'static str, Vec<String>>);

    #[async_trait]
    impl SourceBrowser for MapBrowser {
        async fn list(&self, path: &str) -> Result<Vec<String>, MigrationError> {
            self.0.get(path).cloned().ok_or_else(|| MigrationError::ProcessFailure {
                command: format!("svn ls {}", path),
                code: Some(1),
            })
        }
    }

    fn test_app() -> (Router, DbHandle) {
        let db = DbHandle::new(MigrationDb::new_in_memory().unwrap());
        let manager = Arc::new(MigrationManager::new(
            Arc::new(db.clone()),
            Arc::new(NoopRunner),
            Arc::new(TakenProvisioner),
            Arc::new(NoopPusher),
            MigrationSettings::default(),
        ));
        let browser = MapBrowser(HashMap::from([
            ("simple", vec!["trunk/".to_string(), "tags/".to_string()]),
            ("complex", vec!["module1/".to_string()]),
            ("complex/module1", vec!["trunk/".to_string()]),
        ]));
        let state = Arc::new(AppState {
            db: db.clone(),
            manager,
            browser: Arc::new(browser),
        });
        (api_router().with_state(state), db)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn new_job() -> NewMigration {
        NewMigration {
            svn_group: "legacy/app".into(),
            svn_project: "app".into(),
            gitlab_group: "newhost/app".into(),
            user: "migrator".into(),
            password: "s3cret".into(),
        }
    }

    async fn wait_for_status(db: &DbHandle, id: i64, status: Status) {
        for _ in 0..200 {
            let current = db.lock_sync().unwrap().get_migration(id).unwrap().unwrap().status;
            if current == status {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("Migration {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_migrations_empty() {
        let (app, _) = test_app();
        let request = Request::builder()
            .uri("/api/migrations")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_create_migration_dispatches_job() {
        let (app, db) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/migrations")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "svn_group": "legacy/app",
                    "svn_project": "app",
                    "gitlab_group": "newhost/app",
                    "user": "migrator",
                    "password": "s3cret"
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["svn_group"], "legacy/app");
        assert_eq!(body["status"], "PENDING");
        assert!(body.get("password").is_none());

        let id = body["id"].as_i64().unwrap();
        wait_for_status(&db, id, Status::Failed).await;
        let history = db.lock_sync().unwrap().list_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, Status::Failed);
    }

    #[tokio::test]
    async fn test_create_migration_rejects_escaping_paths() {
        let (app, db) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/migrations")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "svn_group": "../etc",
                    "svn_project": "app",
                    "gitlab_group": "newhost/app",
                    "user": "migrator"
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(db.lock_sync().unwrap().list_migrations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_migration_and_history() {
        let (app, db) = test_app();
        let job = db.lock_sync().unwrap().create_migration(&new_job()).unwrap();

        let request = Request::builder()
            .uri(format!("/api/migrations/{}", job.id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["gitlab_group"], "newhost/app");

        let request = Request::builder()
            .uri(format!("/api/migrations/{}/history", job.id))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_migration_is_404() {
        let (app, _) = test_app();
        for uri in ["/api/migrations/77", "/api/migrations/77/history"] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }

        let request = Request::builder()
            .method("POST")
            .uri("/api/migrations/77/start")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_pending_migration_is_accepted() {
        let (app, db) = test_app();
        let job = db.lock_sync().unwrap().create_migration(&new_job()).unwrap();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/migrations/{}/start", job.id))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        wait_for_status(&db, job.id, Status::Failed).await;

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/migrations/{}/start", job.id))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("FAILED"));
    }

    #[tokio::test]
    async fn test_browse_repository() {
        let (app, _) = test_app();

        let request = Request::builder().uri("/api/svn/simple").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["flat"], true);

        let request = Request::builder().uri("/api/svn/complex").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["flat"], false);
        assert_eq!(body["modules"][0]["name"], "module1");

        let request = Request::builder().uri("/api/svn/missing").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (MigrationError::NotFound { id: 1 }, StatusCode::NOT_FOUND),
            (MigrationError::AlreadyRunning { id: 1 }, StatusCode::CONFLICT),
            (MigrationError::InvalidLayout("..".into()), StatusCode::BAD_REQUEST),
            (
                MigrationError::remote("resolve group", Some(404), "missing"),
                StatusCode::BAD_GATEWAY,
            ),
            (MigrationError::Store(anyhow::anyhow!("disk full")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }
}
