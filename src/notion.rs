//! Notion OAuth: authorize URL and authorization-code exchange.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::NotionSection;

pub const NOTION_API_BASE: &str = "https://api.notion.com";
const NOTION_VERSION: &str = "2022-06-28";

/// Response from `POST /v1/oauth/token` (subset of fields we use).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub bot_id: Option<String>,
    pub workspace_id: String,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub owner: Option<Owner>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Owner {
    #[serde(default)]
    pub user: Option<NotionUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotionUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub person: Option<Person>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Person {
    #[serde(default)]
    pub email: Option<String>,
}

impl TokenResponse {
    fn user(&self) -> Option<&NotionUser> {
        self.owner.as_ref()?.user.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user().map(|u| u.id.as_str())
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user()?.name.as_deref()
    }

    pub fn user_email(&self) -> Option<&str> {
        self.user()?.person.as_ref()?.email.as_deref()
    }
}

fn require<'a>(value: &'a Option<String>, name: &str) -> anyhow::Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("Notion {} is not configured", name))
}

/// The consent page URL the browser is sent to.
pub fn authorize_url(cfg: &NotionSection, state: &str) -> anyhow::Result<String> {
    let client_id = require(&cfg.client_id, "client_id")?;
    let redirect_uri = require(&cfg.redirect_uri, "redirect_uri")?;
    let base = format!("{}/v1/oauth/authorize", cfg.api_base.trim_end_matches('/'));
    let url = url::Url::parse_with_params(
        &base,
        &[
            ("client_id", client_id),
            ("response_type", "code"),
            ("owner", "user"),
            ("redirect_uri", redirect_uri),
            ("state", state),
        ],
    )
    .with_context(|| format!("Invalid Notion API base: {}", cfg.api_base))?;
    Ok(url.to_string())
}

/// Trade an authorization code for a workspace access token.
pub async fn exchange_code(cfg: &NotionSection, code: &str) -> anyhow::Result<TokenResponse> {
    let client_id = require(&cfg.client_id, "client_id")?;
    let client_secret = require(&cfg.client_secret, "client_secret")?;
    let redirect_uri = require(&cfg.redirect_uri, "redirect_uri")?;
    let url = format!("{}/v1/oauth/token", cfg.api_base.trim_end_matches('/'));

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .basic_auth(client_id, Some(client_secret))
        .header("Notion-Version", NOTION_VERSION)
        .json(&serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": redirect_uri,
        }))
        .send()
        .await
        .context("Failed to send token request to Notion")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Notion token endpoint returned {}: {}", status, body.trim());
    }
    resp.json::<TokenResponse>()
        .await
        .context("Failed to parse token response from Notion")
}
