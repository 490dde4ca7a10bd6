//! Configuration for the CLI and the reference backend.
//!
//! Layered: `crm.toml` → `.env` / environment → CLI flags. The file is
//! looked up at `--config`, then `$CRM_HOME/crm.toml`, then `./crm.toml`; a
//! missing file means defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [client]
//! api_url = "http://localhost:4000"
//! dashboard_url = "http://localhost:3000"
//! page_size = 20
//! theme = "dark"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 4000
//! dashboard_port = 3000
//! db_path = "/var/lib/crm/crm.db"
//! token_secret = "change-me"
//! token_ttl_hours = 168
//! dev_mode = false
//!
//! [notion]
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "http://localhost:3000/auth/callback/notion"
//! api_base = "https://api.notion.com"
//!
//! [logging]
//! json = false
//! dir = "/var/log/crm"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::Theme;
use crm_common::filters::MAX_PAGE_SIZE;

pub const CONFIG_FILE: &str = "crm.toml";
const DEV_TOKEN_SECRET: &str = "crm-dev-secret";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub theme: Theme,
}

fn default_api_url() -> String {
    "http://localhost:4000".to_string()
}

fn default_dashboard_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_page_size() -> u32 {
    crm_common::filters::DEFAULT_PAGE_SIZE
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            dashboard_url: default_dashboard_url(),
            page_size: default_page_size(),
            theme: Theme::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,
    /// Defaults to `crm.db` in the state directory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    /// Allows a built-in token secret and permissive CORS.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_dashboard_port() -> u16 {
    3000
}

fn default_token_ttl_hours() -> i64 {
    24 * 7
}

/// Upper bound on `token_ttl_hours`: ten years.
pub const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365 * 10;

impl ServerSection {
    /// Token lifetime, clamped to `1..=MAX_TOKEN_TTL_HOURS` hours.
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_ttl_hours.clamp(1, MAX_TOKEN_TTL_HOURS))
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dashboard_port: default_dashboard_port(),
            db_path: None,
            token_secret: None,
            token_ttl_hours: default_token_ttl_hours(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotionSection {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_notion_api_base")]
    pub api_base: String,
}

fn default_notion_api_base() -> String {
    crate::notion::NOTION_API_BASE.to_string()
}

impl Default for NotionSection {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            api_base: default_notion_api_base(),
        }
    }
}

impl NotionSection {
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.redirect_uri.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    /// When set, logs also go to a daily rolling file here.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Root of `crm.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrmToml {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub notion: NotionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CrmToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crm.toml")
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize crm.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay environment variables. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("CRM_API_URL") {
            self.client.api_url = v;
        }
        if let Some(v) = var("CRM_DASHBOARD_URL") {
            self.client.dashboard_url = v;
        }
        if let Some(v) = var("CRM_TOKEN_SECRET") {
            self.server.token_secret = Some(v);
        }
        if let Some(v) = var("CRM_DB_PATH") {
            self.server.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("CRM_LOG_JSON") {
            self.logging.json = v != "false" && v != "0";
        }
        if let Some(v) = var("NOTION_CLIENT_ID") {
            self.notion.client_id = Some(v);
        }
        if let Some(v) = var("NOTION_CLIENT_SECRET") {
            self.notion.client_secret = Some(v);
        }
        if let Some(v) = var("NOTION_REDIRECT_URI") {
            self.notion.redirect_uri = Some(v);
        }
        if let Some(v) = var("NOTION_API_BASE") {
            self.notion.api_base = v;
        }
    }

    /// Human-readable problems; empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, raw) in [
            ("client.api_url", &self.client.api_url),
            ("client.dashboard_url", &self.client.dashboard_url),
            ("notion.api_base", &self.notion.api_base),
        ] {
            if url::Url::parse(raw).is_err() {
                problems.push(format!("{} is not a valid URL: {}", name, raw));
            }
        }
        if self.client.page_size == 0 {
            problems.push("client.page_size must be at least 1".to_string());
        }
        if self.client.page_size > MAX_PAGE_SIZE {
            problems.push(format!("client.page_size must be at most {}", MAX_PAGE_SIZE));
        }
        if self.server.token_ttl_hours <= 0 {
            problems.push("server.token_ttl_hours must be positive".to_string());
        }
        if self.server.token_ttl_hours > MAX_TOKEN_TTL_HOURS {
            problems.push(format!(
                "server.token_ttl_hours must be at most {}",
                MAX_TOKEN_TTL_HOURS
            ));
        }
        if self.server.port == self.server.dashboard_port && self.server.port != 0 {
            problems.push("server.port and server.dashboard_port must differ".to_string());
        }
        if let Some(secret) = &self.server.token_secret
            && secret.len() < 16
            && !self.server.dev_mode
        {
            problems.push("server.token_secret should be at least 16 characters".to_string());
        }
        problems
    }
}

/// Resolved configuration plus where things live on disk.
#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub toml: CrmToml,
    pub state_dir: PathBuf,
    /// The file that was read, if any.
    pub source: Option<PathBuf>,
}

impl CrmConfig {
    /// Read `.env`, the config file and the environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        // A missing .env is fine; a broken one is worth a warning.
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "ignoring unreadable .env");
        }

        let state_dir = state_dir()?;
        let candidates = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => vec![state_dir.join(CONFIG_FILE), PathBuf::from(CONFIG_FILE)],
        };
        let source = candidates.into_iter().find(|p| p.exists());
        if source.is_none()
            && let Some(path) = explicit
        {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let mut toml = match &source {
            Some(path) => CrmToml::load(path)?,
            None => CrmToml::default(),
        };
        toml.apply_env(|name| std::env::var(name).ok());

        Ok(Self {
            toml,
            state_dir,
            source,
        })
    }

    pub fn with_state_dir(toml: CrmToml, state_dir: PathBuf) -> Self {
        Self {
            toml,
            state_dir,
            source: None,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.toml
            .server
            .db_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("crm.db"))
    }

    /// Signing secret for session tokens. Outside dev mode one must be set.
    pub fn token_secret(&self) -> Result<String> {
        match &self.toml.server.token_secret {
            Some(secret) => Ok(secret.clone()),
            None if self.toml.server.dev_mode => {
                tracing::warn!("no token secret configured, using the development secret");
                Ok(DEV_TOKEN_SECRET.to_string())
            }
            None => anyhow::bail!(
                "No token secret configured. Set CRM_TOKEN_SECRET or server.token_secret in {}",
                CONFIG_FILE
            ),
        }
    }
}

/// `$CRM_HOME`, else the platform config dir plus `crm`.
pub fn state_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("CRM_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::config_dir()
        .map(|dir| dir.join("crm"))
        .context("Could not determine a config directory; set CRM_HOME")
}
