//! JSON query API, tag mutations and the status page.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;
use wpinv_core::{Origin, TagRecord};
use wpinv_storage::StoreError;
use wpinv_sync::{
    Engine, SiteQuery, SiteQueryEngine, SiteView, TagError, TagIndex, WatcherStats, WatcherStatus,
};

pub const CRATE_NAME: &str = "wpinv-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub admin_token: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("WPINV_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            admin_token: std::env::var("WPINV_ADMIN_TOKEN").ok().filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct Denied(pub String);

/// Decides whether a request may mutate tag membership.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), Denied>;
}

/// Bearer-token check against a single shared secret. Without a configured
/// token every mutation is denied.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthorizer {
    token: Option<String>,
}

impl StaticTokenAuthorizer {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), Denied> {
        let Some(expected) = &self.token else {
            return Err(Denied("tag mutations are disabled".into()));
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        match presented {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(Denied("invalid token".into())),
            None => Err(Denied("missing bearer token".into())),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub view: Arc<SiteQueryEngine>,
    pub tags: Arc<TagIndex>,
    pub authorizer: Arc<dyn Authorizer>,
    pub engine: Option<Arc<Engine>>,
}

impl AppState {
    pub fn new(
        view: Arc<SiteQueryEngine>,
        tags: Arc<TagIndex>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            view,
            tags,
            authorizer,
            engine: None,
        }
    }

    pub fn from_engine(engine: Arc<Engine>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            view: Arc::clone(&engine.view),
            tags: Arc::clone(&engine.tags),
            authorizer,
            engine: Some(engine),
        }
    }

    fn watcher_status(&self) -> WatcherStatus {
        self.engine
            .as_ref()
            .map(|engine| engine.watcher_status())
            .unwrap_or(WatcherStatus::Disabled)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Forbidden(#[from] Denied),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ERR_CONFLICT"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "ERR_FORBIDDEN"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        let body = json!({ "error": { "code": code, "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<TagError> for ApiError {
    fn from(err: TagError) -> Self {
        match err {
            TagError::TagNotFound(_) | TagError::NotMember { .. } => {
                ApiError::NotFound(err.to_string())
            }
            TagError::AlreadyMember { .. } => ApiError::Conflict(err.to_string()),
            TagError::Store(err) => err.into(),
        }
    }
}

/// Query string of `GET /api/v1/sites`; `tags` is comma separated.
#[derive(Debug, Default, Deserialize)]
struct SitesParams {
    url: Option<String>,
    search_url: Option<String>,
    tags: Option<String>,
    tagged: Option<bool>,
    text: Option<String>,
    include_deleted: Option<bool>,
    object_names: Option<bool>,
}

impl From<SitesParams> for SiteQuery {
    fn from(params: SitesParams) -> Self {
        SiteQuery {
            url: params.url.filter(|v| !v.is_empty()),
            search_url: params.search_url.filter(|v| !v.is_empty()),
            tags: params
                .tags
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            tagged: params.tagged.unwrap_or(false),
            text: params.text.filter(|v| !v.trim().is_empty()),
            include_deleted: params.include_deleted.unwrap_or(false),
            object_names: params.object_names.unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    watcher: WatcherStatus,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    visible_sites: usize,
    cluster_only: usize,
    canonical_only: usize,
    both_origins: usize,
    hidden_sites: usize,
    tagged_sites: usize,
    total_tags: usize,
    watcher_state: &'static str,
    watcher_detail: String,
    stats: WatcherStats,
    backend: &'static str,
    legacy_feed: bool,
    remove_policy: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(health_handler))
        .route("/api/v1/sites", get(list_sites_handler))
        .route("/api/v1/sites/{id}", get(get_site_handler))
        .route("/api/v1/sites/{id}/tags", get(site_tags_handler))
        .route("/api/v1/tags", get(list_tags_handler))
        .route(
            "/api/v1/tags/{tag_id}/sites/{site_id}",
            post(associate_handler).delete(dissociate_handler),
        )
        .with_state(Arc::new(state))
}

/// Serve until ctrl-c.
pub async fn serve(engine: Arc<Engine>, config: WebConfig) -> anyhow::Result<()> {
    let authorizer = Arc::new(StaticTokenAuthorizer::new(config.admin_token.clone()));
    let state = AppState::from_engine(engine, authorizer);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "serving site inventory");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let everything = SiteQuery {
        include_deleted: true,
        ..Default::default()
    };
    let (sites, tags) = match (
        state.view.list_sites(&everything).await,
        state.tags.list_tags().await,
    ) {
        (Ok(sites), Ok(tags)) => (sites, tags),
        (Err(err), _) => return server_error(err.into()),
        (_, Err(err)) => return server_error(err.into()),
    };
    let by_origins = |wanted: &[Origin]| sites.iter().filter(|s| s.origins == wanted).count();
    let hidden_sites = sites
        .iter()
        .filter(|s| s.stale || s.fields.is_soft_deleted())
        .count();

    let status = state.watcher_status();
    let watcher_detail = match &status {
        WatcherStatus::Watching { resource_version } => {
            format!("resourceVersion {resource_version}")
        }
        WatcherStatus::Reconnecting { attempt, error } => format!("attempt {attempt}: {error}"),
        WatcherStatus::Failed { error } => error.clone(),
        _ => String::new(),
    };
    let (stats, backend, legacy_feed, remove_policy) = match &state.engine {
        Some(engine) => (
            engine.watcher_stats(),
            engine.stores.backend,
            engine.legacy.is_some(),
            format!("{:?}", engine.config.remove_policy),
        ),
        None => (WatcherStats::default(), "memory", false, "n/a".to_string()),
    };

    render_html(IndexTemplate {
        visible_sites: sites.len() - hidden_sites,
        cluster_only: by_origins(&[Origin::Cluster]),
        canonical_only: by_origins(&[Origin::Canonical]),
        both_origins: by_origins(&[Origin::Cluster, Origin::Canonical]),
        hidden_sites,
        tagged_sites: sites.iter().filter(|s| !s.tags.is_empty()).count(),
        total_tags: tags.len(),
        watcher_state: status.label(),
        watcher_detail,
        stats,
        backend,
        legacy_feed,
        remove_policy,
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let watcher = state.watcher_status();
    let (code, status) = match watcher {
        WatcherStatus::Failed { .. } => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
        _ => (StatusCode::OK, "ok"),
    };
    (code, Json(HealthBody { status, watcher })).into_response()
}

async fn list_sites_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SitesParams>,
) -> Result<Json<Vec<SiteView>>, ApiError> {
    let query = SiteQuery::from(params);
    Ok(Json(state.view.list_sites(&query).await?))
}

fn parse_site_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid site id {raw:?}")))
}

async fn get_site_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SiteView>, ApiError> {
    let id = parse_site_id(&id)?;
    state
        .view
        .get_site(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("site {id} not found")))
}

async fn site_tags_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TagRecord>>, ApiError> {
    let id = parse_site_id(&id)?;
    state
        .view
        .tags_for_site(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("site {id} not found")))
}

async fn list_tags_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TagRecord>>, ApiError> {
    Ok(Json(state.tags.list_tags().await?))
}

async fn resolve_site_url(state: &AppState, raw_id: &str) -> Result<String, ApiError> {
    let id = parse_site_id(raw_id)?;
    state
        .view
        .url_for_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("site {id} not found")))
}

async fn associate_handler(
    State(state): State<Arc<AppState>>,
    Path((tag_id, site_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state.authorizer.authorize(&headers)?;
    let url = resolve_site_url(&state, &site_id).await?;
    state.tags.associate(&tag_id, &url).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dissociate_handler(
    State(state): State<Arc<AppState>>,
    Path((tag_id, site_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    state.authorizer.authorize(&headers)?;
    let url = resolve_site_url(&state, &site_id).await?;
    state.tags.dissociate(&tag_id, &url).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "status page failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wpinv_core::{site_id_for_url, CategoryCatalog, KeyDeriver, SiteFields, TagType};
    use wpinv_sources::{
        ObjectMeta, SiteList, SiteObject, SiteSpec, WatchError, WatchEvent, WatchSource,
        WatchStream, WordpressSpec,
    };
    use wpinv_storage::{BackoffPolicy, MemorySiteCollection, MemoryTagStore, SiteCollection};
    use wpinv_sync::{ClusterCache, ResourceWatcher};

    const DEMO: &str = "https://example.org/services/demo/";

    struct Offline;

    #[async_trait]
    impl WatchSource for Offline {
        async fn list(&self) -> Result<SiteList, WatchError> {
            Err(WatchError::Gone)
        }

        async fn watch(&self, _resource_version: &str) -> Result<Box<dyn WatchStream>, WatchError> {
            Err(WatchError::Gone)
        }
    }

    fn demo_object() -> SiteObject {
        SiteObject {
            metadata: ObjectMeta {
                name: Some("example-org-services-demo".into()),
                ..Default::default()
            },
            spec: SiteSpec {
                hostname: Some("example.org".into()),
                path: Some("/services/demo".into()),
                wordpress: WordpressSpec {
                    title: Some("Test".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    async fn test_app() -> Router {
        let cache = ClusterCache::new();
        let watcher = ResourceWatcher::new(
            Arc::new(Offline),
            Arc::clone(&cache),
            CategoryCatalog::default(),
            BackoffPolicy::default(),
        );
        watcher.apply_event(WatchEvent::Added(demo_object())).await;

        let sites = Arc::new(MemorySiteCollection::new());
        sites
            .upsert(
                DEMO,
                &SiteFields {
                    comment: Some("hello".into()),
                    ..Default::default()
                },
                Some("leg-001"),
            )
            .await
            .unwrap();
        let tags = Arc::new(MemoryTagStore::with_tags([TagRecord {
            id: "fac-enac".into(),
            name_fr: "ENAC".into(),
            name_en: "ENAC".into(),
            url_fr: String::new(),
            url_en: String::new(),
            tag_type: TagType::Faculty,
            sites: Vec::new(),
        }]));
        let view = Arc::new(SiteQueryEngine::new(
            cache.reader(),
            sites,
            tags,
            CategoryCatalog::default(),
            KeyDeriver::default(),
        ));
        let index = Arc::new(TagIndex::new(Arc::clone(&view)));
        let authorizer = Arc::new(StaticTokenAuthorizer::new(Some("secret".into())));
        app(AppState::new(view, index, authorizer))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn mutate(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn site_query_returns_the_merged_record() {
        let app = test_app().await;
        let resp = app
            .oneshot(get("/api/v1/sites?url=https://example.org/services/demo/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["title"], "Test");
        assert_eq!(body[0]["comment"], "hello");
        assert_eq!(body[0]["id"], site_id_for_url(DEMO).to_string());
        assert_eq!(body[0]["origins"], json!(["cluster", "canonical"]));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let app = test_app().await;
        let missing = app
            .clone()
            .oneshot(get(&format!("/api/v1/sites/{}", Uuid::nil())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(missing).await["error"]["code"], "ERR_NOT_FOUND");

        let garbage = app.oneshot(get("/api/v1/sites/not-a-uuid")).await.unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tag_mutations_require_authorization() {
        let app = test_app().await;
        let uri = format!("/api/v1/tags/fac-enac/sites/{}", site_id_for_url(DEMO));

        let anonymous = app.clone().oneshot(mutate("POST", &uri, None)).await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

        let wrong = app
            .clone()
            .oneshot(mutate("POST", &uri, Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let tags = app.oneshot(get("/api/v1/tags")).await.unwrap();
        let body = body_json(tags).await;
        assert_eq!(body[0]["sites"], json!([]));
    }

    #[tokio::test]
    async fn associate_then_search_then_conflict() {
        let app = test_app().await;
        let uri = format!("/api/v1/tags/fac-enac/sites/{}", site_id_for_url(DEMO));

        let created = app
            .clone()
            .oneshot(mutate("POST", &uri, Some("secret")))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::NO_CONTENT);

        let again = app
            .clone()
            .oneshot(mutate("POST", &uri, Some("secret")))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let found = app
            .clone()
            .oneshot(get("/api/v1/sites?tags=enac"))
            .await
            .unwrap();
        let body = body_json(found).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["tags"][0]["id"], "fac-enac");

        let site_tags = app
            .clone()
            .oneshot(get(&format!("/api/v1/sites/{}/tags", site_id_for_url(DEMO))))
            .await
            .unwrap();
        assert_eq!(body_json(site_tags).await.as_array().unwrap().len(), 1);

        let removed = app
            .clone()
            .oneshot(mutate("DELETE", &uri, Some("secret")))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::NO_CONTENT);

        let missing_tag = app
            .oneshot(mutate(
                "POST",
                &format!("/api/v1/tags/nope/sites/{}", site_id_for_url(DEMO)),
                Some("secret"),
            ))
            .await
            .unwrap();
        assert_eq!(missing_tag.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_page_and_health_render() {
        let app = test_app().await;
        let page = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let body = page.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Site inventory"));

        let health = app.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(body_json(health).await["watcher"]["state"], "disabled");
    }
}
