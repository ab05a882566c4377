use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::errors::MigrationError;

/// A GitLab group (subset of fields we care about).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupHandle {
    pub id: i64,
    pub full_path: String,
}

/// A GitLab project (subset of fields we care about).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectHandle {
    pub id: i64,
    pub path_with_namespace: String,
    #[serde(default)]
    pub http_url_to_repo: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateProjectBody<'a> {
    name: &'a str,
    path: &'a str,
    namespace_id: i64,
}

/// Destination-side project provisioning.
/// Real implementation: `GitLabClient`.
#[async_trait]
pub trait ProjectProvisioner: Send + Sync {
    async fn resolve_group(&self, group_path: &str) -> Result<GroupHandle, MigrationError>;

    async fn create_project(
        &self,
        group: &GroupHandle,
        project_name: &str,
    ) -> Result<ProjectHandle, MigrationError>;
}

pub struct GitLabClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, MigrationError> {
        let base = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            MigrationError::remote("configure client", None, format!("invalid GitLab URL '{}': {}", base_url, e))
        })?;
        Ok(Self {
            http: reqwest::Client::builder()
                .user_agent("svnlift")
                .build()
                .map_err(|e| MigrationError::remote("configure client", None, e.to_string()))?,
            base,
            token: token.into(),
        })
    }

    /// `{base}/api/v4/<segments>`, each segment percent-encoded (so a group
    /// path `a/b` becomes the single segment `a%2Fb`).
    fn endpoint(&self, segments: &[&str]) -> Result<Url, MigrationError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MigrationError::remote("build url", None, "GitLab URL cannot be a base"))?
            .pop_if_empty()
            .extend(["api", "v4"])
            .extend(segments);
        Ok(url)
    }
}

/// Pull GitLab's `message`/`error` field out of an error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").or_else(|| v.get("error")).cloned())
        .map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        })
        .unwrap_or_else(|| body.trim().to_string())
}

async fn expect_json<T: serde::de::DeserializeOwned>(
    operation: &str,
    resp: reqwest::Response,
) -> Result<T, MigrationError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = match status {
            StatusCode::NOT_FOUND => format!("not found: {}", error_message(&body)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                format!("permission denied: {}", error_message(&body))
            }
            _ => error_message(&body),
        };
        return Err(MigrationError::remote(operation, Some(status.as_u16()), message));
    }
    resp.json::<T>()
        .await
        .map_err(|e| MigrationError::remote(operation, Some(status.as_u16()), format!("unexpected response: {}", e)))
}

#[async_trait]
impl ProjectProvisioner for GitLabClient {
    async fn resolve_group(&self, group_path: &str) -> Result<GroupHandle, MigrationError> {
        const OP: &str = "resolve group";
        let url = self.endpoint(&["groups", group_path])?;
        let resp = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| MigrationError::remote(OP, None, e.to_string()))?;
        let group: GroupHandle = expect_json(OP, resp).await?;
        tracing::info!(group = %group.full_path, group_id = group.id, "resolved destination group");
        Ok(group)
    }

    async fn create_project(
        &self,
        group: &GroupHandle,
        project_name: &str,
    ) -> Result<ProjectHandle, MigrationError> {
        const OP: &str = "create project";
        let url = self.endpoint(&["projects"])?;
        let resp = self
            .http
            .post(url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&CreateProjectBody {
                name: project_name,
                path: project_name,
                namespace_id: group.id,
            })
            .send()
            .await
            .map_err(|e| MigrationError::remote(OP, None, e.to_string()))?;
        let project: ProjectHandle = expect_json(OP, resp).await?;
        tracing::info!(project = %project.path_with_namespace, project_id = project.id, "created destination project");
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
    };
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeGitLab {
        existing: Mutex<Vec<String>>,
        created: Mutex<Vec<(String, i64)>>,
    }

    async fn get_group(headers: HeaderMap, Path(path): Path<String>) -> impl IntoResponse {
        if headers.get("PRIVATE-TOKEN").map(|v| v.as_bytes()) != Some(b"token-123".as_slice()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"message": "401 Unauthorized"})),
            );
        }
        if path == "newhost/app" {
            (
                StatusCode::OK,
                Json(serde_json::json!({"id": 7, "full_path": "newhost/app", "name": "app"})),
            )
        } else {
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"message": "404 Group Not Found"})),
            )
        }
    }

    async fn post_project(
        State(state): State<Arc<FakeGitLab>>,
        Json(body): Json<serde_json::Value>,
    ) -> impl IntoResponse {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        let namespace_id = body["namespace_id"].as_i64().unwrap_or_default();
        if state.existing.lock().unwrap().contains(&name) {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"message": {"name": ["has already been taken"]}})),
            );
        }
        state.created.lock().unwrap().push((name.clone(), namespace_id));
        (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": 42,
                "path_with_namespace": format!("newhost/app/{}", name),
                "http_url_to_repo": format!("http://gitlab.local/newhost/app/{}.git", name),
            })),
        )
    }

    async fn spawn_fake(state: Arc<FakeGitLab>) -> String {
        let app = Router::new()
            .route("/api/v4/groups/{path}", get(get_group))
            .route("/api/v4/projects", post(post_project))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_endpoint_encodes_group_path_as_one_segment() {
        let client = GitLabClient::new("https://gitlab.example.com/", "t").unwrap();
        let url = client.endpoint(&["groups", "newhost/app"]).unwrap();
        assert_eq!(url.as_str(), "https://gitlab.example.com/api/v4/groups/newhost%2Fapp");
    }

    #[test]
    fn test_endpoint_keeps_base_path_prefix() {
        let client = GitLabClient::new("https://example.com/gitlab", "t").unwrap();
        let url = client.endpoint(&["projects"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/gitlab/api/v4/projects");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(matches!(
            GitLabClient::new("not a url", "t"),
            Err(MigrationError::RemoteApi { .. })
        ));
    }

    #[test]
    fn test_error_message_prefers_message_field() {
        assert_eq!(error_message(r#"{"message":"404 Group Not Found"}"#), "404 Group Not Found");
        assert_eq!(error_message(r#"{"error":"invalid_token"}"#), "invalid_token");
        assert_eq!(
            error_message(r#"{"message":{"name":["has already been taken"]}}"#),
            r#"{"name":["has already been taken"]}"#
        );
        assert_eq!(error_message("  plain text  "), "plain text");
    }

    #[tokio::test]
    async fn test_resolve_group_and_create_project() {
        let fake = Arc::new(FakeGitLab::default());
        let base = spawn_fake(fake.clone()).await;
        let client = GitLabClient::new(&base, "token-123").unwrap();

        let group = client.resolve_group("newhost/app").await.unwrap();
        assert_eq!(group, GroupHandle { id: 7, full_path: "newhost/app".into() });

        let project = client.create_project(&group, "app").await.unwrap();
        assert_eq!(project.id, 42);
        assert_eq!(project.path_with_namespace, "newhost/app/app");
        assert_eq!(fake.created.lock().unwrap().as_slice(), &[("app".to_string(), 7)]);
    }

    #[tokio::test]
    async fn test_missing_group_is_remote_error() {
        let base = spawn_fake(Arc::new(FakeGitLab::default())).await;
        let client = GitLabClient::new(&base, "token-123").unwrap();

        match client.resolve_group("nobody/here").await {
            Err(MigrationError::RemoteApi { status, message, .. }) => {
                assert_eq!(status, Some(404));
                assert!(message.contains("Group Not Found"));
            }
            other => panic!("Expected RemoteApi, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_token_is_permission_denied() {
        let base = spawn_fake(Arc::new(FakeGitLab::default())).await;
        let client = GitLabClient::new(&base, "wrong").unwrap();

        match client.resolve_group("newhost/app").await {
            Err(MigrationError::RemoteApi { status, message, .. }) => {
                assert_eq!(status, Some(401));
                assert!(message.starts_with("permission denied"));
            }
            other => panic!("Expected RemoteApi, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_existing_project_is_remote_error() {
        let fake = Arc::new(FakeGitLab::default());
        fake.existing.lock().unwrap().push("app".into());
        let base = spawn_fake(fake.clone()).await;
        let client = GitLabClient::new(&base, "token-123").unwrap();

        let group = client.resolve_group("newhost/app").await.unwrap();
        match client.create_project(&group, "app").await {
            Err(MigrationError::RemoteApi { operation, status, message }) => {
                assert_eq!(operation, "create project");
                assert_eq!(status, Some(400));
                assert!(message.contains("has already been taken"));
            }
            other => panic!("Expected RemoteApi, got {:?}", other),
        }
        assert!(fake.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_remote_error() {
        let client = GitLabClient::new("http://127.0.0.1:1", "token-123").unwrap();
        let err = client.resolve_group("newhost/app").await.unwrap_err();
        assert!(matches!(err, MigrationError::RemoteApi { status: None, .. }));
    }
}
