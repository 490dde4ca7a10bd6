//! Typed HTTP client for the CRM REST API.
//!
//! One generic operation per verb (`list`, `get`, `create`, `update`,
//! `delete`), instantiated per entity through [`Resource`]. Hooks and the
//! board talk to the backend through the [`ResourceApi`] trait so tests can
//! substitute an in-memory implementation.
//!
//! No retries: a transport failure or non-2xx status is returned to the
//! caller as a [`ClientError`] carrying the server's message.

#[cfg(test)]
pub(crate) mod memory;

use std::time::Duration;

use async_trait::async_trait;
use crm_common::{ListQuery, Page, Resource, User};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use crate::context::{AppContext, Credential};
use crate::errors::ClientError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Real implementation: [`ApiClient`]. Test double: `memory::MemoryApi`.
#[async_trait]
pub trait ResourceApi<R: Resource>: Send + Sync {
    async fn list(&self, query: &ListQuery<R::Filter>) -> Result<Page<R>, ClientError>;

    async fn get(&self, id: i64) -> Result<R, ClientError>;

    async fn create(&self, payload: &R::Create) -> Result<R, ClientError>;

    async fn update(&self, id: i64, patch: &R::Update) -> Result<R, ClientError>;

    async fn delete(&self, id: i64) -> Result<(), ClientError>;
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    credential: Option<Credential>,
}

impl ApiClient {
    pub fn new(ctx: &AppContext) -> Result<Self, ClientError> {
        Url::parse(&ctx.api_base)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", ctx.api_base, e)))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("crm/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::Network)?;
        Ok(Self {
            http,
            base: ctx.api_base.trim_end_matches('/').to_string(),
            credential: ctx.credential.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        let raw = format!("{}{}", self.base, path);
        Url::parse(&raw).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", raw, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let mut builder = self.http.request(method, self.url(path)?);
        if let Some(credential) = &self.credential {
            builder = builder.bearer_auth(credential.expose());
        }
        Ok(builder)
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ClientError> {
        let resp = Self::checked(builder).await?;
        let bytes = resp.bytes().await.map_err(ClientError::Network)?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Send and turn a non-2xx status into [`ClientError::Status`].
    async fn checked(builder: RequestBuilder) -> Result<Response, ClientError> {
        let resp = builder.send().await.map_err(ClientError::Network)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        });
        tracing::debug!(status = status.as_u16(), %message, "request rejected");
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn item_path<R: Resource>(id: i64) -> String {
        format!("{}/{}", R::PATH, id)
    }

    pub async fn list<R: Resource>(
        &self,
        query: &ListQuery<R::Filter>,
    ) -> Result<Page<R>, ClientError> {
        let builder = self.request(Method::GET, R::PATH)?.query(&query.query_pairs());
        Self::send_json(builder).await
    }

    pub async fn get<R: Resource>(&self, id: i64) -> Result<R, ClientError> {
        let builder = self.request(Method::GET, &Self::item_path::<R>(id))?;
        Self::send_json(builder).await
    }

    pub async fn create<R: Resource>(&self, payload: &R::Create) -> Result<R, ClientError> {
        let builder = self.request(Method::POST, R::PATH)?.json(payload);
        Self::send_json(builder).await
    }

    pub async fn update<R: Resource>(&self, id: i64, patch: &R::Update) -> Result<R, ClientError> {
        let builder = self
            .request(Method::PATCH, &Self::item_path::<R>(id))?
            .json(patch);
        Self::send_json(builder).await
    }

    pub async fn delete<R: Resource>(&self, id: i64) -> Result<(), ClientError> {
        let builder = self.request(Method::DELETE, &Self::item_path::<R>(id))?;
        Self::checked(builder).await?;
        Ok(())
    }

    pub async fn current_user(&self) -> Result<User, ClientError> {
        let builder = self.request(Method::GET, "/auth/me")?;
        Self::send_json(builder).await
    }
}

#[async_trait]
impl<R: Resource> ResourceApi<R> for ApiClient {
    async fn list(&self, query: &ListQuery<R::Filter>) -> Result<Page<R>, ClientError> {
        ApiClient::list::<R>(self, query).await
    }

    async fn get(&self, id: i64) -> Result<R, ClientError> {
        ApiClient::get::<R>(self, id).await
    }

    async fn create(&self, payload: &R::Create) -> Result<R, ClientError> {
        ApiClient::create::<R>(self, payload).await
    }

    async fn update(&self, id: i64, patch: &R::Update) -> Result<R, ClientError> {
        ApiClient::update::<R>(self, id, patch).await
    }

    async fn delete(&self, id: i64) -> Result<(), ClientError> {
        ApiClient::delete::<R>(self, id).await
    }
}

/// Pull the human-readable message out of an error body.
///
/// Understands `{"error": "..."}`, `{"message": "..."}` and
/// `{"message": ["...", "..."]}`.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    for key in ["error", "message"] {
        match value.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Array(parts)) => {
                let joined = parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                if !joined.is_empty() {
                    return Some(joined);
                }
            }
            _ => {}
        }
    }
    None
}

/// Read every page of a collection until the reported total is reached or
/// an empty page comes back. `skip` advances by the rows actually received,
/// so a backend that returns fewer than `take` still yields every row once.
pub async fn fetch_all<R: Resource>(
    api: &dyn ResourceApi<R>,
    filter: R::Filter,
    page_size: u32,
) -> Result<Vec<R>, ClientError> {
    let mut query = ListQuery::new(filter).with_window(0, page_size);
    let mut items = Vec::new();
    loop {
        let page = api.list(&query).await?;
        let received = page.items.len();
        items.extend(page.items);
        if received == 0 || items.len() as u64 >= page.total {
            break;
        }
        query.skip = query.skip.saturating_add(received as u32);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryApi, fixtures};
    use crm_common::{Deal, DealFilter};

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(error_message(r#"{"error":"Deal 4 not found"}"#).as_deref(), Some("Deal 4 not found"));
        assert_eq!(error_message(r#"{"message":"Unauthorized"}"#).as_deref(), Some("Unauthorized"));
        assert_eq!(
            error_message(r#"{"message":["name is required","value must be positive"]}"#).as_deref(),
            Some("name is required; value must be positive")
        );
        assert_eq!(error_message("<html>502</html>"), None);
        assert_eq!(error_message(r#"{"error":""}"#), None);
    }

    #[test]
    fn test_new_rejects_invalid_base() {
        let ctx = AppContext::new("not a url");
        assert!(matches!(ApiClient::new(&ctx), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_url_joins_base_path() {
        let client = ApiClient::new(&AppContext::new("http://localhost:4000/api/")).unwrap();
        assert_eq!(client.base_url(), "http://localhost:4000/api");
        let url = client.url("/deals/3").unwrap();
        assert_eq!(url.as_str(), "http://localhost:4000/api/deals/3");
    }

    #[tokio::test]
    async fn test_fetch_all_partitions_pages() {
        let deals: Vec<Deal> = (1..=45).map(|id| fixtures::deal(id, 10, id as i32)).collect();
        let api = MemoryApi::deals(deals);

        let all = fetch_all::<Deal>(&api, DealFilter::default(), 20).await.unwrap();
        let ids: Vec<i64> = all.iter().map(|d| d.id).collect();
        assert_eq!(ids, (1..=45).collect::<Vec<_>>());
        assert_eq!(api.list_windows(), vec![(0, 20), (20, 20), (40, 20)]);
    }

    #[tokio::test]
    async fn test_fetch_all_advances_by_rows_received() {
        let deals: Vec<Deal> = (1..=45).map(|id| fixtures::deal(id, 10, id as i32)).collect();
        let api = MemoryApi::deals(deals);
        api.cap_take(15);

        let all = fetch_all::<Deal>(&api, DealFilter::default(), 20).await.unwrap();
        let ids: Vec<i64> = all.iter().map(|d| d.id).collect();
        assert_eq!(ids, (1..=45).collect::<Vec<_>>());
        assert_eq!(api.list_windows(), vec![(0, 20), (15, 20), (30, 20)]);
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_empty_collection() {
        let api = MemoryApi::deals(Vec::new());
        let all = fetch_all::<Deal>(&api, DealFilter::default(), 20).await.unwrap();
        assert!(all.is_empty());
        assert_eq!(api.list_windows().len(), 1);
    }
}
