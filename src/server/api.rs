use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{
        Path, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use chrono::{DateTime, Duration, Utc};
use crm_common::filters::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crm_common::{
    Contact, ContactFilter, ContactUpdate, Deal, DealFilter, DealStatus, DealUpdate, ListQuery,
    NewContact, NewDeal, NewPipeline, NewTag, Page, Pipeline, PipelineFilter, PipelineUpdate,
    QueryFilter, Tag, TagFilter, TagUpdate, User,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::db::{DbHandle, NotionIdentity};
#[cfg(test)]
use super::db::CrmDb;
use crate::config::NotionSection;
use crate::errors::ServerError;
use crate::notion;
use crate::session::token::{self, Claims};

const OAUTH_STATE_TTL_MINUTES: i64 = 10;

// ── Shared application state ──────────────────────────────────────────

pub struct AuthSettings {
    pub secret: Vec<u8>,
    pub ttl: Duration,
}

pub struct AppState {
    pub db: DbHandle,
    pub auth: AuthSettings,
    pub notion: NotionSection,
    /// Base URL of the dashboard the OAuth callback lands on.
    pub dashboard_url: String,
    /// Outstanding OAuth `state` nonces and when they were handed out.
    pub oauth_states: Mutex<HashMap<String, DateTime<Utc>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, auth: AuthSettings, notion: NotionSection, dashboard_url: &str) -> Self {
        Self {
            db,
            auth,
            notion,
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
            oauth_states: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue_token(&self, user: &User) -> Result<String, ApiError> {
        let claims = Claims::new(user.id, &user.email, Utc::now(), self.auth.ttl);
        token::issue(&claims, &self.auth.secret).map_err(|e| ApiError::Internal(e.to_string()))
    }

    fn remember_oauth_state(&self, nonce: &str) {
        let now = Utc::now();
        let mut states = self
            .oauth_states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.retain(|_, issued| now - *issued < Duration::minutes(OAUTH_STATE_TTL_MINUTES));
        states.insert(nonce.to_string(), now);
    }

    /// Consume a nonce. Each one is good for a single callback.
    fn take_oauth_state(&self, nonce: &str) -> bool {
        let mut states = self
            .oauth_states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match states.remove(nonce) {
            Some(issued) => Utc::now() - issued < Duration::minutes(OAUTH_STATE_TTL_MINUTES),
            None => false,
        }
    }
}

/// The authenticated caller, inserted by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i64,
    pub email: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            ServerError::BadRequest(msg) => ApiError::BadRequest(msg),
            ServerError::Unauthorized(msg) => ApiError::Unauthorized(msg),
            ServerError::Notion(_) => ApiError::BadGateway(err.to_string()),
            ServerError::Database(source) => {
                error!(error = %format!("{:#}", source), "database failure");
                ApiError::Internal("Internal server error".into())
            }
        }
    }
}

/// Store errors carry a [`ServerError`] when they are the caller's fault.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ServerError>() {
            Ok(server) => server.into(),
            Err(other) => ServerError::Database(other).into(),
        }
    }
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::BadRequest(format!("Invalid id '{}'", raw)))
}

fn payload<T: DeserializeOwned>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

// ── Authentication ────────────────────────────────────────────────────

/// Bearer-token middleware for the protected routes.
pub async fn require_auth(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

async fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    let claims = token::verify(bearer, &state.auth.secret, Utc::now()).map_err(|e| {
        debug!(error = %e, "rejected bearer token");
        ApiError::Unauthorized(e.to_string())
    })?;

    let user_id = claims.sub;
    let user = state.db.call(move |db| db.get_user(user_id)).await?;
    match user {
        Some(user) if user.is_active => Ok(AuthUser {
            id: user.id,
            email: user.email,
        }),
        _ => Err(ApiError::Unauthorized("Unknown or inactive user".into())),
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/pipelines", get(list_pipelines).post(create_pipeline))
        .route(
            "/pipelines/{id}",
            get(get_pipeline)
                .patch(update_pipeline)
                .delete(delete_pipeline),
        )
        .route("/deals", get(list_deals).post(create_deal))
        .route(
            "/deals/{id}",
            get(get_deal).patch(update_deal).delete(delete_deal),
        )
        .route("/contacts", get(list_contacts).post(create_contact))
        .route(
            "/contacts/{id}",
            get(get_contact).patch(update_contact).delete(delete_contact),
        )
        .route("/tags", get(list_tags).post(create_tag))
        .route(
            "/tags/{id}",
            get(get_tag).patch(update_tag).delete(delete_tag),
        )
        .route("/auth/me", get(current_user))
        .route_layer(middleware::from_fn_with_state(state, require_auth));

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/notion/authorize", get(notion_authorize))
        .route("/auth/notion/callback", get(notion_callback))
        .merge(protected)
}

// ── List parameters ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub skip: Option<u32>,
    pub take: Option<u32>,
    pub search: Option<String>,
    pub pipeline_id: Option<i64>,
    pub stage_id: Option<i64>,
    pub status: Option<String>,
    pub tag_id: Option<i64>,
}

impl ListParams {
    fn from_query(query: Result<Query<ListParams>, QueryRejection>) -> Result<Self, ApiError> {
        query
            .map(|Query(params)| params)
            .map_err(|e| ApiError::BadRequest(e.body_text()))
    }

    fn window<F: QueryFilter>(&self, filter: F) -> ListQuery<F> {
        let take = self.take.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        ListQuery::new(filter).with_window(self.skip.unwrap_or(0), take)
    }

    fn search(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    fn status(&self) -> Result<Option<DealStatus>, ApiError> {
        self.status
            .as_deref()
            .map(|s| s.parse::<DealStatus>().map_err(ApiError::BadRequest))
            .transpose()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn current_user(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<User>, ApiError> {
    let id = user.id;
    let user = state.db.call(move |db| db.get_user(id)).await?;
    user.map(Json)
        .ok_or_else(|| ApiError::Unauthorized("Unknown or inactive user".into()))
}

async fn list_pipelines(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Page<Pipeline>>, ApiError> {
    let params = ListParams::from_query(query)?;
    let query = params.window(PipelineFilter {
        search: params.search(),
    });
    let page = state
        .db
        .call(move |db| db.list_pipelines(user.id, &query))
        .await?;
    Ok(Json(page))
}

async fn create_pipeline(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<NewPipeline>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let input = payload(body)?;
    let pipeline = state
        .db
        .call(move |db| db.create_pipeline(user.id, &input))
        .await?;
    info!(pipeline_id = pipeline.id, "pipeline created");
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn get_pipeline(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<Json<Pipeline>, ApiError> {
    let id = parse_id(&raw)?;
    let pipeline = state
        .db
        .call(move |db| db.get_pipeline(user.id, id))
        .await?;
    pipeline
        .map(Json)
        .ok_or_else(|| ServerError::not_found("Pipeline", id).into())
}

async fn update_pipeline(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
    body: Result<Json<PipelineUpdate>, JsonRejection>,
) -> Result<Json<Pipeline>, ApiError> {
    let id = parse_id(&raw)?;
    let update = payload(body)?;
    let pipeline = state
        .db
        .call(move |db| db.update_pipeline(user.id, id, &update))
        .await?;
    Ok(Json(pipeline))
}

async fn delete_pipeline(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&raw)?;
    let deleted = state
        .db
        .call(move |db| db.delete_pipeline(user.id, id))
        .await?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ServerError::not_found("Pipeline", id).into()),
    }
}

async fn list_deals(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Page<Deal>>, ApiError> {
    let params = ListParams::from_query(query)?;
    let query = params.window(DealFilter {
        pipeline_id: params.pipeline_id,
        stage_id: params.stage_id,
        status: params.status()?,
        search: params.search(),
    });
    let page = state
        .db
        .call(move |db| db.list_deals(user.id, &query))
        .await?;
    Ok(Json(page))
}

async fn create_deal(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<NewDeal>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let input = payload(body)?;
    let deal = state
        .db
        .call(move |db| db.create_deal(user.id, &input))
        .await?;
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn get_deal(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<Json<Deal>, ApiError> {
    let id = parse_id(&raw)?;
    let deal = state.db.call(move |db| db.get_deal(user.id, id)).await?;
    deal.map(Json)
        .ok_or_else(|| ServerError::not_found("Deal", id).into())
}

async fn update_deal(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
    body: Result<Json<DealUpdate>, JsonRejection>,
) -> Result<Json<Deal>, ApiError> {
    let id = parse_id(&raw)?;
    let patch = payload(body)?;
    let is_move = patch.stage_id.is_some() || patch.position.is_some();
    let deal = state
        .db
        .call(move |db| db.update_deal(user.id, id, &patch))
        .await
        .inspect_err(|e| {
            if is_move {
                warn!(deal_id = id, error = %e, "deal move rejected");
            }
        })?;
    Ok(Json(deal))
}

async fn delete_deal(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&raw)?;
    let deleted = state.db.call(move |db| db.delete_deal(user.id, id)).await?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ServerError::not_found("Deal", id).into()),
    }
}

async fn list_contacts(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Page<Contact>>, ApiError> {
    let params = ListParams::from_query(query)?;
    let query = params.window(ContactFilter {
        search: params.search(),
        tag_id: params.tag_id,
    });
    let page = state
        .db
        .call(move |db| db.list_contacts(user.id, &query))
        .await?;
    Ok(Json(page))
}

async fn create_contact(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<NewContact>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let input = payload(body)?;
    let contact = state
        .db
        .call(move |db| db.create_contact(user.id, &input))
        .await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn get_contact(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<Json<Contact>, ApiError> {
    let id = parse_id(&raw)?;
    let contact = state
        .db
        .call(move |db| db.get_contact(user.id, id))
        .await?;
    contact
        .map(Json)
        .ok_or_else(|| ServerError::not_found("Contact", id).into())
}

async fn update_contact(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
    body: Result<Json<ContactUpdate>, JsonRejection>,
) -> Result<Json<Contact>, ApiError> {
    let id = parse_id(&raw)?;
    let patch = payload(body)?;
    let contact = state
        .db
        .call(move |db| db.update_contact(user.id, id, &patch))
        .await?;
    Ok(Json(contact))
}

async fn delete_contact(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&raw)?;
    let deleted = state
        .db
        .call(move |db| db.delete_contact(user.id, id))
        .await?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ServerError::not_found("Contact", id).into()),
    }
}

/// Tags come back as a bare array.
async fn list_tags(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    query: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<Tag>>, ApiError> {
    let params = ListParams::from_query(query)?;
    let filter = TagFilter {
        search: params.search(),
    };
    let tags = state
        .db
        .call(move |db| db.list_tags(user.id, &filter))
        .await?;
    Ok(Json(tags))
}

async fn create_tag(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    body: Result<Json<NewTag>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let input = payload(body)?;
    let tag = state
        .db
        .call(move |db| db.create_tag(user.id, &input))
        .await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

async fn get_tag(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<Json<Tag>, ApiError> {
    let id = parse_id(&raw)?;
    let tag = state.db.call(move |db| db.get_tag(user.id, id)).await?;
    tag.map(Json)
        .ok_or_else(|| ServerError::not_found("Tag", id).into())
}

async fn update_tag(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
    body: Result<Json<TagUpdate>, JsonRejection>,
) -> Result<Json<Tag>, ApiError> {
    let id = parse_id(&raw)?;
    let patch = payload(body)?;
    let tag = state
        .db
        .call(move |db| db.update_tag(user.id, id, &patch))
        .await?;
    Ok(Json(tag))
}

async fn delete_tag(
    State(state): State<SharedState>,
    Extension(user): Extension<AuthUser>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&raw)?;
    let deleted = state.db.call(move |db| db.delete_tag(user.id, id)).await?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ServerError::not_found("Tag", id).into()),
    }
}

// ── Notion OAuth ──────────────────────────────────────────────────────

async fn notion_authorize(State(state): State<SharedState>) -> Result<Redirect, ApiError> {
    if !state.notion.is_configured() {
        return Err(ApiError::BadRequest("Notion OAuth is not configured".into()));
    }
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let url = notion::authorize_url(&state.notion, &nonce)
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    state.remember_oauth_state(&nonce);
    info!("sending browser to Notion consent page");
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

async fn notion_callback(
    State(state): State<SharedState>,
    query: Result<Query<CallbackParams>, QueryRejection>,
) -> Result<Redirect, ApiError> {
    let Query(params) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if let Some(reason) = params.error {
        warn!(%reason, "Notion consent was not granted");
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("error", &reason)
            .finish();
        return Ok(Redirect::temporary(&format!(
            "{}/login?{}",
            state.dashboard_url, query
        )));
    }

    let nonce = params
        .state
        .ok_or_else(|| ApiError::BadRequest("Missing OAuth state".into()))?;
    if !state.take_oauth_state(&nonce) {
        return Err(ApiError::BadRequest("Unknown or expired OAuth state".into()));
    }
    let code = params
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing authorization code".into()))?;

    let grant = notion::exchange_code(&state.notion, &code)
        .await
        .map_err(|e| ServerError::Notion(format!("{:#}", e)))?;
    let identity = NotionIdentity {
        notion_user_id: grant
            .user_id()
            .ok_or_else(|| ServerError::Notion("token response names no user".into()))?
            .to_string(),
        email: grant
            .user_email()
            .ok_or_else(|| ServerError::Notion("token response carries no email".into()))?
            .to_string(),
        name: grant.user_name().map(String::from),
        workspace_id: grant.workspace_id.clone(),
        access_token: grant.access_token.clone(),
    };

    let user = state
        .db
        .call(move |db| db.upsert_notion_user(&identity))
        .await?;
    let token = state.issue_token(&user)?;
    info!(user_id = user.id, workspace = ?grant.workspace_name, "Notion login");
    Ok(Redirect::temporary(&format!(
        "{}/dashboard?token={}",
        state.dashboard_url, token
    )))
}

// ── Tests ─────────────────────────────────────────────────────────────
