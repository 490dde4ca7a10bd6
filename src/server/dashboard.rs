//! Session-gated dashboard shell.
//!
//! Every page goes through [`session_guard`]; the HTML is a bare shell that
//! names the page and the API it talks to.

use std::sync::Arc;

use axum::{
    Router,
    extract::{RawQuery, Request, State},
    http::{StatusCode, header::SET_COOKIE},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};

use crate::session::guard::clear_cookie;
use crate::session::{GuardPaths, Session, session_guard};

/// Pages and their titles. `/login` is the only auth path.
const PAGES: &[(&str, &str)] = &[
    ("/login", "Sign in"),
    ("/dashboard", "Dashboard"),
    ("/pipelines", "Pipelines"),
    ("/contacts", "Contacts"),
    ("/tags", "Tags"),
    ("/settings", "Settings"),
];

pub struct DashboardConfig {
    pub paths: Arc<GuardPaths>,
    /// Public base URL of the REST backend.
    pub api_url: String,
}

impl DashboardConfig {
    pub fn new(api_url: &str) -> Self {
        Self {
            paths: Arc::new(GuardPaths::default()),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }
}

pub fn dashboard_router(config: DashboardConfig) -> Router {
    let paths = config.paths.clone();
    let mut pages = Router::new();
    for (path, _) in PAGES {
        pages = pages.route(path, get(page));
    }
    let pages = pages.route_layer(middleware::from_fn_with_state(paths, session_guard));

    Router::new()
        .route("/", get(|| async { Redirect::temporary("/dashboard") }))
        .route("/logout", get(logout))
        .route("/auth/callback/notion", get(notion_callback))
        .merge(pages)
        .fallback(not_found)
        .with_state(Arc::new(config))
}

async fn page(State(config): State<Arc<DashboardConfig>>, req: Request) -> Html<String> {
    let path = req.uri().path();
    let title = PAGES
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, t)| *t)
        .unwrap_or("CRM");
    let session = req.extensions().get::<Session>();
    Html(render(&config, path, title, session))
}

fn render(config: &DashboardConfig, path: &str, title: &str, session: Option<&Session>) -> String {
    let body = match session {
        None => format!(
            r#"<a class="notion-login" href="{}/auth/notion/authorize">Continue with Notion</a>"#,
            escape(&config.api_url)
        ),
        Some(session) => format!(
            r#"<header><span class="user">{}</span> <a href="/logout">Sign out</a></header>"#,
            escape(&session.claims.email)
        ),
    };
    format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>{title} · CRM</title></head>
<body>
<main data-page="{page}" data-api="{api}">
<h1>{title}</h1>
{body}
</main>
</body>
</html>
"#,
        title = escape(title),
        page = escape(path.trim_start_matches('/')),
        api = escape(&config.api_url),
        body = body,
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Notion's redirect URI points at the dashboard; hand the query to the API.
async fn notion_callback(
    State(config): State<Arc<DashboardConfig>>,
    RawQuery(query): RawQuery,
) -> Redirect {
    let target = match query {
        Some(q) if !q.is_empty() => format!("{}/auth/notion/callback?{}", config.api_url, q),
        _ => format!("{}/auth/notion/callback", config.api_url),
    };
    Redirect::temporary(&target)
}

async fn logout(State(config): State<Arc<DashboardConfig>>) -> Response {
    let location = config.paths.login.clone();
    (
        [(SET_COOKIE, clear_cookie())],
        Redirect::temporary(&location),
    )
        .into_response()
}

async fn not_found() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::NOT_FOUND,
        Html(
            r#"<!doctype html><title>Not found · CRM</title><p>Page not found. <a href="/dashboard">Back</a></p>"#,
        ),
    )
}
