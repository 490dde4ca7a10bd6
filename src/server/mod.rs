//! Reference backend: REST API, SQLite store and dashboard shell.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  mod.rs  (ServerConfig, spawn, start_server)     │
//! │ (crm CLI │ <─────── │    ├─ api.rs  (REST handlers, bearer auth)       │
//! │  / hooks)│          │    │     │                                        │
//! └──────────┘          │    │     v                                        │
//!                       │    │  db.rs  (CrmDb behind DbHandle)              │
//! ┌──────────┐   HTTP   │    │                                              │
//! │ Browser  │ ───────> │    └─ dashboard.rs  (session-gated page shell)    │
//! └──────────┘          └──────────────────────────────────────────────────┘
//! ```
//!
//! The API and the dashboard listen on separate ports. Notion's OAuth
//! redirect lands on the dashboard, which forwards it to the API callback;
//! the API then sends the browser back to `/dashboard?token=<jwt>`.

pub mod api;
pub mod dashboard;
pub mod db;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{CrmConfig, NotionSection};
use api::{AppState, AuthSettings, SharedState};
use dashboard::DashboardConfig;
use db::{CrmDb, DbHandle};

/// Configuration for `crm serve`.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dashboard_port: u16,
    pub db_path: PathBuf,
    pub token_secret: String,
    pub token_ttl: chrono::Duration,
    pub notion: NotionSection,
    /// Public URLs used in redirects between the two listeners.
    pub api_url: String,
    pub dashboard_url: String,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            dashboard_port: 3000,
            db_path: PathBuf::from("crm.db"),
            token_secret: String::new(),
            token_ttl: chrono::Duration::hours(24 * 7),
            notion: NotionSection::default(),
            api_url: "http://localhost:4000".to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &CrmConfig) -> Result<Self> {
        let toml = &config.toml;
        Ok(Self {
            host: toml.server.host.clone(),
            port: toml.server.port,
            dashboard_port: toml.server.dashboard_port,
            db_path: config.db_path(),
            token_secret: config.token_secret()?,
            token_ttl: toml.server.token_ttl(),
            notion: toml.notion.clone(),
            api_url: toml.client.api_url.clone(),
            dashboard_url: toml.client.dashboard_url.clone(),
            dev_mode: toml.server.dev_mode,
        })
    }
}

pub fn build_api_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router(state.clone())
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

pub fn build_dashboard_router(api_url: &str) -> Router {
    dashboard::dashboard_router(DashboardConfig::new(api_url)).layer(TraceLayer::new_for_http())
}

/// A server running in the background.
pub struct RunningServer {
    pub api_addr: SocketAddr,
    pub dashboard_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<std::io::Result<()>>>,
}

impl RunningServer {
    pub fn api_url(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    pub fn dashboard_url(&self) -> String {
        format!("http://{}", self.dashboard_addr)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await.context("Server task panicked")??;
        }
        tracing::info!("server shut down gracefully");
        Ok(())
    }
}

fn open_db(path: &std::path::Path) -> Result<CrmDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    CrmDb::new(path).context("Failed to initialize CRM database")
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))
}

/// Bind both listeners and serve them on background tasks. Port 0 picks a
/// free port; the bound addresses are on the returned handle.
pub async fn spawn(config: ServerConfig) -> Result<RunningServer> {
    if config.token_secret.is_empty() {
        anyhow::bail!("A token secret is required to start the server");
    }
    let db = open_db(&config.db_path)?;
    let state = Arc::new(AppState::new(
        DbHandle::new(db),
        AuthSettings {
            secret: config.token_secret.into_bytes(),
            ttl: config.token_ttl,
        },
        config.notion,
        &config.dashboard_url,
    ));

    let api_listener = bind(&config.host, config.port).await?;
    let dashboard_listener = bind(&config.host, config.dashboard_port).await?;
    let api_addr = api_listener.local_addr()?;
    let dashboard_addr = dashboard_listener.local_addr()?;

    // With port 0 the configured URLs cannot be right; point at the bound port.
    let api_url = if config.port == 0 {
        format!("http://{}", api_addr)
    } else {
        config.api_url
    };

    let (shutdown, signal) = watch::channel(false);
    let tasks = vec![
        serve(api_listener, build_api_router(state, config.dev_mode), signal.clone()),
        serve(
            dashboard_listener,
            build_dashboard_router(&api_url),
            signal,
        ),
    ];

    tracing::info!(api = %api_addr, dashboard = %dashboard_addr, "CRM server listening");
    Ok(RunningServer {
        api_addr,
        dashboard_addr,
        shutdown,
        tasks,
    })
}

fn serve(
    listener: TcpListener,
    app: Router,
    mut signal: watch::Receiver<bool>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = signal.wait_for(|stop| *stop).await;
            })
            .await
    })
}

/// Run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let server = spawn(config).await?;
    println!("CRM API running at {}", server.api_url());
    println!("Dashboard running at {}", server.dashboard_url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    tracing::info!("shutting down");
    server.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            port: 0,
            dashboard_port: 0,
            db_path: dir.join("nested").join("crm.db"),
            token_secret: "server-test-secret".into(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_serves_health_and_shuts_down() {
        let dir = tempfile::TempDir::new().unwrap();
        let server = spawn(test_config(dir.path())).await.unwrap();
        assert!(dir.path().join("nested").join("crm.db").exists());

        let body = reqwest::get(format!("{}/health", server.api_url()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_requires_secret() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            token_secret: String::new(),
            ..test_config(dir.path())
        };
        let err = spawn(config).await.err().unwrap();
        assert!(err.to_string().contains("token secret"));
    }

    #[test]
    fn test_from_config_uses_dev_secret_in_dev_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut toml = crate::config::CrmToml::default();
        toml.server.dev_mode = true;
        let config = CrmConfig::with_state_dir(toml, dir.path().to_path_buf());

        let server = ServerConfig::from_config(&config).unwrap();
        assert!(!server.token_secret.is_empty());
        assert_eq!(server.db_path, dir.path().join("crm.db"));
        assert_eq!(server.port, 4000);
    }

    #[test]
    fn test_from_config_without_secret_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config =
            CrmConfig::with_state_dir(crate::config::CrmToml::default(), dir.path().to_path_buf());
        assert!(ServerConfig::from_config(&config).is_err());
    }
}
