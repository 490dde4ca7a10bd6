use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use chrono::{DateTime, Utc};

use super::token::{self, Claims};

pub const TOKEN_COOKIE: &str = "token";
pub const TOKEN_PARAM: &str = "token";

/// Route layout the guard redirects between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPaths {
    pub login: String,
    pub dashboard: String,
    /// Pages reachable without a session. Signed-in users are sent away.
    pub auth_paths: Vec<String>,
}

impl Default for GuardPaths {
    fn default() -> Self {
        Self {
            login: "/login".into(),
            dashboard: "/dashboard".into(),
            auth_paths: vec!["/login".into()],
        }
    }
}

impl GuardPaths {
    pub fn is_auth_path(&self, path: &str) -> bool {
        self.auth_paths.iter().any(|p| p == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieAction {
    Keep,
    Set(String),
    Clear,
}

impl CookieAction {
    pub fn header(&self) -> Option<String> {
        match self {
            CookieAction::Keep => None,
            CookieAction::Set(token) => Some(set_cookie(token)),
            CookieAction::Clear => Some(clear_cookie()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Proceed,
    Redirect(String),
}

/// What to do with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    pub cookie: CookieAction,
    /// Claims of the session the request runs under, if any.
    pub session: Option<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub claims: Claims,
}

pub fn set_cookie(token: &str) -> String {
    format!("{}={}; Path=/; SameSite=Lax", TOKEN_COOKIE, token)
}

pub fn clear_cookie() -> String {
    format!("{}=; Path=/; Max-Age=0; SameSite=Lax", TOKEN_COOKIE)
}

/// Value of `name` in a `Cookie` header (or a stored `Set-Cookie` line).
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

/// Value of `name` in a raw query string.
pub fn query_value(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn session_from(token: String, now: DateTime<Utc>) -> Option<Session> {
    let claims = token::inspect(&token).ok()?;
    if claims.is_expired_at(now) {
        return None;
    }
    Some(Session { token, claims })
}

/// Decide routing and cookie handling for a page request.
///
/// A URL token takes precedence over the cookie and is written to the
/// cookie when it is structurally valid and unexpired; an unusable URL token
/// is ignored. An unusable cookie is cleared.
pub fn decide(
    paths: &GuardPaths,
    path: &str,
    query: Option<&str>,
    cookie_header: Option<&str>,
    now: DateTime<Utc>,
) -> Decision {
    let url_token = query
        .and_then(|q| query_value(q, TOKEN_PARAM))
        .filter(|t| !t.is_empty());
    let cookie_token = cookie_header
        .and_then(|h| cookie_value(h, TOKEN_COOKIE))
        .filter(|t| !t.is_empty());

    let from_url = url_token.and_then(|t| session_from(t, now));
    let (session, cookie) = match from_url {
        Some(session) => {
            let action = if cookie_token.as_deref() == Some(session.token.as_str()) {
                CookieAction::Keep
            } else {
                CookieAction::Set(session.token.clone())
            };
            (Some(session), action)
        }
        None => match cookie_token {
            Some(t) => match session_from(t, now) {
                Some(session) => (Some(session), CookieAction::Keep),
                None => (None, CookieAction::Clear),
            },
            None => (None, CookieAction::Keep),
        },
    };

    let outcome = match (&session, paths.is_auth_path(path)) {
        (None, false) => Outcome::Redirect(paths.login.clone()),
        (Some(_), true) => Outcome::Redirect(paths.dashboard.clone()),
        _ => Outcome::Proceed,
    };

    Decision {
        outcome,
        cookie,
        session,
    }
}

/// Axum middleware enforcing [`decide`] on a page router. The session, when
/// present, is available to handlers as an `Extension<Session>`.
pub async fn session_guard(
    State(paths): State<Arc<GuardPaths>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let cookie_header = req
        .headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let decision = decide(
        &paths,
        req.uri().path(),
        req.uri().query(),
        cookie_header.as_deref(),
        Utc::now(),
    );

    let mut response = match decision.outcome {
        Outcome::Redirect(location) => {
            tracing::debug!(from = %req.uri().path(), to = %location, "session redirect");
            Redirect::temporary(&location).into_response()
        }
        Outcome::Proceed => {
            if let Some(session) = decision.session {
                req.extensions_mut().insert(session);
            }
            next.run(req).await
        }
    };

    if let Some(cookie) = decision.cookie.header() {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn valid_token() -> String {
        let claims = Claims::new(1, "ada@example.com", now(), Duration::hours(1));
        token::issue(&claims, b"s").unwrap()
    }

    fn expired_token() -> String {
        let claims = Claims::new(1, "ada@example.com", now() - Duration::hours(3), Duration::hours(1));
        token::issue(&claims, b"s").unwrap()
    }

    #[test]
    fn test_anonymous_page_request_redirects_to_login() {
        let d = decide(&GuardPaths::default(), "/pipelines", None, None, now());
        assert_eq!(d.outcome, Outcome::Redirect("/login".into()));
        assert_eq!(d.cookie, CookieAction::Keep);
    }

    #[test]
    fn test_anonymous_login_proceeds() {
        let d = decide(&GuardPaths::default(), "/login", None, None, now());
        assert_eq!(d.outcome, Outcome::Proceed);
    }

    #[test]
    fn test_signed_in_login_redirects_to_dashboard() {
        let cookie = format!("token={}", valid_token());
        let d = decide(&GuardPaths::default(), "/login", None, Some(&cookie), now());
        assert_eq!(d.outcome, Outcome::Redirect("/dashboard".into()));
    }

    #[test]
    fn test_url_token_is_promoted_to_cookie() {
        let token = valid_token();
        let query = format!("token={}", token);
        let d = decide(&GuardPaths::default(), "/dashboard", Some(&query), None, now());
        assert_eq!(d.outcome, Outcome::Proceed);
        assert_eq!(d.cookie, CookieAction::Set(token.clone()));
        assert_eq!(
            d.cookie.header().unwrap(),
            format!("token={}; Path=/; SameSite=Lax", token)
        );
        assert_eq!(d.session.unwrap().claims.sub, 1);
    }

    #[test]
    fn test_url_token_wins_over_cookie() {
        let fresh = valid_token();
        let query = format!("token={}", fresh);
        let d = decide(
            &GuardPaths::default(),
            "/tags",
            Some(&query),
            Some("theme=dark; token=old-value"),
            now(),
        );
        assert_eq!(d.cookie, CookieAction::Set(fresh));
    }

    #[test]
    fn test_expired_cookie_is_cleared() {
        let cookie = format!("token={}", expired_token());
        let d = decide(&GuardPaths::default(), "/contacts", None, Some(&cookie), now());
        assert_eq!(d.outcome, Outcome::Redirect("/login".into()));
        assert_eq!(d.cookie, CookieAction::Clear);
        assert!(d.cookie.header().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn test_malformed_cookie_is_cleared() {
        let d = decide(&GuardPaths::default(), "/login", None, Some("token=junk"), now());
        assert_eq!(d.outcome, Outcome::Proceed);
        assert_eq!(d.cookie, CookieAction::Clear);
    }

    #[test]
    fn test_cookie_value_parsing() {
        assert_eq!(cookie_value("a=1; token=xyz; b=2", "token").as_deref(), Some("xyz"));
        assert_eq!(cookie_value("token=abc; Path=/; SameSite=Lax", "token").as_deref(), Some("abc"));
        assert_eq!(cookie_value("tokens=1", "token"), None);
    }

    #[test]
    fn test_query_value_decodes() {
        assert_eq!(query_value("a=1&token=x%2Ey", "token").as_deref(), Some("x.y"));
    }
}
