//! The control-plane HTTP API — a thin collaborator in front of the
//! Engine. Handlers only ever admit work (create rows, check quota) or
//! read state back; every external I/O call (clone, build, run, stop)
//! happens inside the Engine's own control loop, never inline in a
//! request handler.
//!
//! Built on `axum`: one `AppState` + `with_state` shared across routes,
//! and a `TypedHeader<Authorization<Bearer>>` extractor for the bearer
//! token — standing in for an external identity provider this crate
//! doesn't implement (it resolves an owner id and nothing else).

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{headers, Json, Router, TypedHeader};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tower_http::trace::TraceLayer;

use crate::driver::ContainerDriver;
use crate::engine::Engine;
use crate::model::{App, Deployment, EnvVar, Plan, Status, User};
use crate::quota::{Feature, QuotaGate};
use crate::store::StateStore;

use crate::error::{Error, Result};

/// Shared handles every handler needs.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub driver: Arc<dyn ContainerDriver>,
    pub quota: Arc<dyn QuotaGate>,
    pub engine: Arc<Engine>,
    pub base_domain: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/:id", get(get_app).delete(delete_app))
        .route("/apps/:id/redeploy", post(redeploy))
        .route("/apps/:id/deployments", get(list_deployments))
        .route(
            "/apps/:id/env",
            get(list_env_vars).post(set_env_var).delete(delete_env_var),
        )
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/logs", get(get_deployment_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The authenticated owner id, resolved from a bearer token. No
/// session/JWT verification happens here — that is an external identity
/// provider's job; this extractor only reads whatever token made it
/// through and treats it as an opaque owner id.
pub struct OwnerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let TypedHeader(headers::Authorization(bearer)) =
            TypedHeader::<headers::Authorization<headers::authorization::Bearer>>::from_request_parts(
                parts, state,
            )
            .await
            .map_err(|_| Error::Input("missing or malformed Authorization: Bearer <owner>".to_string()))?;

        let token = bearer.token().trim();
        if token.is_empty() {
            return Err(Error::Input("empty bearer token".to_string()));
        }
        Ok(OwnerId(token.to_string()))
    }
}

/// Looks up the bearer owner's user record, bootstrapping a `Plan::Free`
/// one on first contact since the identity provider that would normally
/// create it isn't part of this crate.
async fn get_or_create_user(state: &AppState, owner_id: &str) -> Result<User> {
    if let Some(user) = state.store.get_user(owner_id).await? {
        return Ok(user);
    }
    state
        .store
        .upsert_user(owner_id, &format!("{owner_id}@users.invalid"), Plan::Free)
        .await
}

/// Fetches `id`, mapping both "doesn't exist" and "belongs to someone
/// else" to a plain 404 so the API never reveals another owner's apps.
async fn app_owned_by(state: &AppState, id: &str, owner_id: &str) -> Result<App> {
    let app = state
        .store
        .get_app(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("app '{id}' not found")))?;
    if app.owner_id != owner_id {
        return Err(Error::NotFound(format!("app '{id}' not found")));
    }
    Ok(app)
}

#[derive(Debug, Serialize)]
pub struct AppResponse {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub slug: String,
    pub repo_url: String,
    pub branch: String,
    pub status: Status,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppResponse {
    fn from_app(app: &App, base_domain: &str) -> Self {
        Self {
            id: app.id.clone(),
            owner_id: app.owner_id.clone(),
            name: app.name.clone(),
            slug: app.slug.clone(),
            repo_url: app.repo_url.clone(),
            branch: app.branch.clone(),
            status: app.status,
            url: app.url(base_domain),
            created_at: app.created_at,
            updated_at: app.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
}

#[derive(Debug, Serialize)]
pub struct CreateAppResponse {
    pub app: AppResponse,
    pub deployment: Deployment,
}

async fn create_app(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Json(req): Json<CreateAppRequest>,
) -> Result<(StatusCode, Json<CreateAppResponse>)> {
    if req.name.trim().is_empty() {
        return Err(Error::Input("app name must not be empty".to_string()));
    }
    if req.repo_url.trim().is_empty() {
        return Err(Error::Input("repo_url must not be empty".to_string()));
    }
    if req.branch.trim().is_empty() {
        return Err(Error::Input("branch must not be empty".to_string()));
    }

    let user = get_or_create_user(&state, &owner_id).await?;
    state.quota.check_app_creation(&owner_id, user.plan).await?;

    let slug = crate::model::slugify(&req.name);
    let app = state
        .store
        .create_app(&owner_id, &req.name, &slug, &req.repo_url, &req.branch)
        .await?;
    let deployment = state.store.create_deployment(&app.id).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateAppResponse {
            app: AppResponse::from_app(&app, &state.base_domain),
            deployment,
        }),
    ))
}

async fn list_apps(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
) -> Result<Json<Vec<AppResponse>>> {
    let apps = state.store.list_apps_by_owner(&owner_id).await?;
    Ok(Json(
        apps.iter()
            .map(|a| AppResponse::from_app(a, &state.base_domain))
            .collect(),
    ))
}

#[derive(Debug, Default, Serialize)]
pub struct UsageResponse {
    pub memory_used_mb: f64,
    pub memory_used_pct: f64,
    pub disk_used_gb: f64,
    pub disk_used_pct: f64,
    pub restart_count: i64,
}

impl From<crate::driver::UsageStats> for UsageResponse {
    fn from(s: crate::driver::UsageStats) -> Self {
        Self {
            memory_used_mb: s.memory_used_mb,
            memory_used_pct: s.memory_used_pct,
            disk_used_gb: s.disk_used_gb,
            disk_used_pct: s.disk_used_pct,
            restart_count: s.restart_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AppDetailResponse {
    pub app: AppResponse,
    pub latest_deployment: Option<Deployment>,
    pub usage: Option<UsageResponse>,
}

async fn get_app(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<AppDetailResponse>> {
    let app = app_owned_by(&state, &id, &owner_id).await?;
    let deployments = state.store.list_deployments_by_app(&id).await?;
    let latest_deployment = deployments.into_iter().next();

    let usage = match latest_deployment.as_ref().and_then(|d| d.container_ref.as_deref()) {
        Some(container_ref) => {
            let limits = state.driver.get_resource_limits(container_ref).await?;
            Some(state.driver.get_usage_stats(container_ref, limits).await?.into())
        }
        None => None,
    };

    Ok(Json(AppDetailResponse {
        app: AppResponse::from_app(&app, &state.base_domain),
        latest_deployment,
        usage,
    }))
}

async fn delete_app(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    app_owned_by(&state, &id, &owner_id).await?;
    state.engine.delete_app(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Advisory re-check mirroring `engine::pipeline::admit`'s authoritative
/// one: the app already counts toward the owner's quota, so only a plan
/// downgrade since creation would trip this. Both checks must converge on
/// the same decision; this one is advisory, the Engine's is authoritative.
async fn check_redeploy_quota(state: &AppState, owner_id: &str) -> Result<()> {
    let user = get_or_create_user(state, owner_id).await?;
    let limits = state.quota.limits_for(user.plan);
    let count = state.store.count_apps_by_owner(owner_id).await?;
    if count.saturating_sub(1) >= limits.max_apps {
        return Err(Error::Quota(format!(
            "plan allows at most {} apps for this owner",
            limits.max_apps
        )));
    }
    Ok(())
}

async fn redeploy(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Deployment>)> {
    app_owned_by(&state, &id, &owner_id).await?;
    check_redeploy_quota(&state, &owner_id).await?;
    let deployment = state.store.create_deployment(&id).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn list_deployments(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<Vec<Deployment>>> {
    app_owned_by(&state, &id, &owner_id).await?;
    Ok(Json(state.store.list_deployments_by_app(&id).await?))
}

async fn deployment_owned_by(state: &AppState, id: i64, owner_id: &str) -> Result<Deployment> {
    let deployment = state
        .store
        .get_deployment(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("deployment {id} not found")))?;
    app_owned_by(state, &deployment.app_id, owner_id).await?;
    Ok(deployment)
}

async fn get_deployment(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<i64>,
) -> Result<Json<Deployment>> {
    Ok(Json(deployment_owned_by(&state, id, &owner_id).await?))
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub build_log: Option<String>,
    pub runtime_log: Option<String>,
}

/// Returns `build_log` as last persisted and a freshly-pulled
/// `runtime_log` when the deployment is still `Running` — the store's
/// copy is overwritten with whatever the Driver reports now, which is
/// lossy if the container restarted in between (see DESIGN.md).
async fn get_deployment_logs(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<i64>,
) -> Result<Json<LogsResponse>> {
    let deployment = deployment_owned_by(&state, id, &owner_id).await?;
    let app = state
        .store
        .get_app(&deployment.app_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("app '{}' not found", deployment.app_id)))?;
    let user = get_or_create_user(&state, &app.owner_id).await?;
    state.quota.check_feature(user.plan, Feature::RuntimeLogs)?;

    let runtime_log = match (&deployment.container_ref, deployment.status) {
        (Some(container_ref), Status::Running) => {
            let fresh = state.driver.get_logs(container_ref, 500).await?;
            state
                .store
                .update_deployment(
                    crate::store::DeploymentUpdate::new(id).runtime_log(fresh.as_str()),
                )
                .await?;
            Some(fresh)
        }
        _ => deployment.runtime_log,
    };

    Ok(Json(LogsResponse {
        build_log: deployment.build_log,
        runtime_log,
    }))
}

#[derive(Debug, Serialize)]
pub struct EnvVarResponse {
    pub key: String,
    pub value: String,
}

impl From<EnvVar> for EnvVarResponse {
    fn from(e: EnvVar) -> Self {
        Self {
            key: e.key,
            value: e.value,
        }
    }
}

async fn list_env_vars(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<Vec<EnvVarResponse>>> {
    app_owned_by(&state, &id, &owner_id).await?;
    let vars = state.store.list_env_vars(&id).await?;
    Ok(Json(vars.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct SetEnvVarRequest {
    pub key: String,
    pub value: String,
}

async fn set_env_var(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
    Json(req): Json<SetEnvVarRequest>,
) -> Result<StatusCode> {
    app_owned_by(&state, &id, &owner_id).await?;
    if req.key.trim().is_empty() {
        return Err(Error::Input("env var key must not be empty".to_string()));
    }
    state.store.set_env_var(&id, &req.key, &req.value).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DeleteEnvVarQuery {
    pub key: String,
}

async fn delete_env_var(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(id): Path<String>,
    Query(query): Query<DeleteEnvVarQuery>,
) -> Result<StatusCode> {
    app_owned_by(&state, &id, &owner_id).await?;
    state.store.delete_env_var(&id, &query.key).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ContainerDriver, ResourceLimits, UsageStats};
    use crate::quota::StoreBackedQuotaGate;
    use crate::router::{Binding, RouterBinding};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path as StdPath;
    use tower::ServiceExt;

    struct NullDriver;

    #[async_trait]
    impl ContainerDriver for NullDriver {
        async fn build_image(
            &self,
            _workdir: &StdPath,
            _image_ref: &str,
            _on_log: &mut (dyn FnMut(String) + Send),
        ) -> Result<()> {
            Ok(())
        }
        async fn run_container(
            &self,
            _image_ref: &str,
            _container_name: &str,
            _container_port: u16,
            _host_port: u16,
            _env: &[(String, String)],
            _limits: ResourceLimits,
        ) -> Result<String> {
            Ok("container".to_string())
        }
        async fn stop(&self, _container_ref: &str, _timeout_secs: u32) -> Result<()> {
            Ok(())
        }
        async fn remove(&self, _container_ref: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_image(&self, _image_ref: &str) -> Result<()> {
            Ok(())
        }
        async fn get_logs(&self, _container_ref: &str, _tail_lines: usize) -> Result<String> {
            Ok(String::new())
        }
        async fn get_resource_limits(&self, _container_ref: &str) -> Result<ResourceLimits> {
            Ok(ResourceLimits {
                memory_mb: 256,
                cpu_shares: 512,
                disk_gb: 1,
            })
        }
        async fn get_usage_stats(
            &self,
            _container_ref: &str,
            _limits: ResourceLimits,
        ) -> Result<UsageStats> {
            Ok(UsageStats::default())
        }
        async fn is_running(&self, _container_ref: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct NullRouter;

    #[async_trait]
    impl RouterBinding for NullRouter {
        async fn bind(&self, _subdomain: &str, _app_id: &str, _host_port: u16) -> Result<()> {
            Ok(())
        }
        async fn unbind(&self, _subdomain: &str) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _subdomain: &str) -> Option<Binding> {
            None
        }
    }

    async fn test_state() -> AppState {
        let store = Arc::new(SqliteStore::new_in_memory().await);
        let quota = Arc::new(StoreBackedQuotaGate::new(
            Arc::clone(&store),
            Plan::Custom.limits(),
        ));
        let config = crate::config::Config {
            database_url: "sqlite::memory:".to_string(),
            container_host: "unix:///dev/null".to_string(),
            base_domain: "apps.example.test".to_string(),
            workroot: std::env::temp_dir(),
            poll_interval_ms: 1000,
            max_in_flight: 1,
            build_timeout_secs: 60,
            run_timeout_secs: 60,
            stop_timeout_secs: 5,
            bind_address: "127.0.0.1:0".to_string(),
        };
        let engine = Engine::new(
            store.clone(),
            Arc::new(crate::source::GitSourceFetcher::new()),
            Arc::new(NullDriver),
            Arc::new(NullRouter),
            quota.clone(),
            config,
        );
        AppState {
            store,
            driver: Arc::new(NullDriver),
            quota,
            engine,
            base_domain: "apps.example.test".to_string(),
        }
    }

    #[tokio::test]
    async fn create_app_requires_bearer_token() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/apps")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"name": "hello", "repo_url": "git://x", "branch": "main"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_then_list_apps_round_trips() {
        let app = build_router(test_state().await);
        let create = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/apps")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer u1")
                    .body(Body::from(
                        serde_json::json!({"name": "hello", "repo_url": "git://x", "branch": "main"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::CREATED);

        let list = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/apps")
                    .header("authorization", "Bearer u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(list.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_app_hides_other_owners_apps() {
        let state = test_state().await;
        let created = state
            .store
            .create_app("u1", "hello", "hello", "git://x", "main")
            .await
            .unwrap();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/apps/{}", created.id))
                    .header("authorization", "Bearer u2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
