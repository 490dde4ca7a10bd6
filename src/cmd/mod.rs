//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                            |
//! | `auth`          | `Token`, `Login`, `Logout`, `Whoami`               |
//! | `pipelines`     | `Pipelines`, `Board`                               |
//! | `deals`         | `Deals`                                            |
//! | `contacts`      | `Contacts`, `Tags`                                 |
//! | `config`        | `Config`                                           |

pub mod auth;
pub mod config;
pub mod contacts;
pub mod deals;
pub mod pipelines;
pub mod serve;

pub use auth::{cmd_login, cmd_logout, cmd_token, cmd_whoami};
pub use config::cmd_config;
pub use contacts::{cmd_contacts, cmd_tags};
pub use deals::cmd_deals;
pub use pipelines::{cmd_board, cmd_pipelines};
pub use serve::{ServeOverrides, cmd_serve};

use anyhow::{Context, Result};
use crm::client::ApiClient;
use crm::config::CrmConfig;
use crm::context::{AppContext, Credential};
use crm::logging::{self, LogOptions};
use crm::session::CredentialStore;
use crm_common::filters::MAX_PAGE_SIZE;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;

use crate::Cli;

const TOKEN_ENV: &str = "CRM_TOKEN";

/// Resolved configuration shared by every command.
pub struct CliEnv {
    pub config: CrmConfig,
    pub json: bool,
}

impl CliEnv {
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = CrmConfig::resolve(cli.config.as_deref())?;
        if let Some(url) = &cli.api_url {
            config.toml.client.api_url = url.clone();
        }
        Ok(Self {
            config,
            json: cli.json,
        })
    }

    pub fn init_logging(&self, verbose: bool) -> Result<Option<WorkerGuard>> {
        logging::init(&LogOptions {
            verbose,
            json: self.config.toml.logging.json,
            dir: self.config.toml.logging.dir.clone(),
        })
    }

    pub fn store(&self) -> CredentialStore {
        CredentialStore::new(&self.config.state_dir)
    }

    /// `CRM_TOKEN` wins over the stored credential.
    pub fn credential(&self) -> Result<Option<Credential>> {
        if let Some(credential) = std::env::var(TOKEN_ENV).ok().and_then(Credential::new) {
            return Ok(Some(credential));
        }
        self.store().load()
    }

    pub fn context(&self) -> Result<AppContext> {
        Ok(AppContext::new(&self.config.toml.client.api_url)
            .with_credential(self.credential()?)
            .with_theme(self.config.toml.client.theme))
    }

    /// A client for commands that need a signed-in user.
    pub fn client(&self) -> Result<ApiClient> {
        let ctx = self.context()?;
        if !ctx.is_authenticated() {
            anyhow::bail!("Not signed in. Run `crm login` or set {}", TOKEN_ENV);
        }
        ApiClient::new(&ctx).context("Failed to build API client")
    }

    pub fn page_size(&self) -> u32 {
        self.config.toml.client.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Print `value` as JSON when `--json` is set; otherwise run `human`.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(value).context("Failed to serialize output")?
            );
        } else {
            human();
        }
        Ok(())
    }
}

/// `skip` for a 1-based page number.
pub(crate) fn page_skip(page: u32, size: u32) -> u32 {
    page.saturating_sub(1).saturating_mul(size)
}

pub(crate) fn format_money(value: f64) -> String {
    format!("{:.2}", value)
}
