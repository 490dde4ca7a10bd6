//! Reference backend command: `crm serve`.

use std::path::PathBuf;

use anyhow::Result;
use crm::server::{ServerConfig, start_server};

use super::CliEnv;

pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dashboard_port: Option<u16>,
    pub db: Option<PathBuf>,
    pub dev: bool,
    pub open: bool,
}

pub async fn cmd_serve(env: &CliEnv, overrides: ServeOverrides) -> Result<()> {
    let mut config = env.config.clone();
    if overrides.dev {
        config.toml.server.dev_mode = true;
    }
    if let Some(db) = overrides.db {
        config.toml.server.db_path = Some(db);
    }

    let mut server = ServerConfig::from_config(&config)?;
    if let Some(host) = overrides.host {
        server.host = host;
    }
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if let Some(port) = overrides.dashboard_port {
        server.dashboard_port = port;
    }
    if !server.notion.is_configured() {
        tracing::warn!("Notion OAuth is not configured; sign-in will fail until it is");
    }

    // Skip in dev mode (no browser inside containers)
    if overrides.open && !server.dev_mode {
        let url = format!("{}/login", server.dashboard_url.trim_end_matches('/'));
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            if let Err(e) = open::that(&url) {
                eprintln!("Failed to open browser: {}", e);
            }
        });
    }

    start_server(server).await
}
