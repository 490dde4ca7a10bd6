//! Session commands: `crm token`, `crm login`, `crm logout`, `crm whoami`.

use anyhow::{Context, Result};
use chrono::Utc;
use crm::context::Credential;
use crm::server::db::CrmDb;
use crm::session::token::{self, Claims};
use serde_json::json;

use super::CliEnv;
use crate::TokenCommands;

pub fn cmd_token(env: &CliEnv, command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Issue { email, name } => {
            let email = email.trim().to_lowercase();
            if email.is_empty() {
                anyhow::bail!("--email cannot be blank");
            }
            let secret = env.config.token_secret()?;
            let db_path = env.config.db_path();
            if let Some(parent) = db_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
            let db = CrmDb::new(&db_path)?;
            let user = db.ensure_user(&email, name.as_deref())?;

            let ttl = env.config.toml.server.token_ttl();
            let claims = Claims::new(user.id, &user.email, Utc::now(), ttl);
            let jwt = token::issue(&claims, secret.as_bytes())?;
            tracing::info!(user_id = user.id, "issued token");
            env.emit(&json!({ "userId": user.id, "token": jwt }), || {
                println!("{}", jwt);
            })
        }
        TokenCommands::Inspect { token: raw } => {
            let raw = match raw {
                Some(raw) => raw,
                None => env
                    .credential()?
                    .map(|c| c.expose().to_string())
                    .context("No token given and none stored")?,
            };
            let claims = token::inspect(&raw)?;
            let expired = claims.is_expired_at(Utc::now());
            env.emit(&claims, || {
                println!("user:    {} ({})", claims.sub, claims.email);
                if let Some(exp) = claims.expires_at() {
                    let state = if expired {
                        console::style("expired").red().to_string()
                    } else {
                        console::style("valid").green().to_string()
                    };
                    println!("expires: {} ({})", exp.to_rfc3339(), state);
                }
            })
        }
    }
}

pub fn cmd_login(env: &CliEnv, raw_token: Option<&str>, url: Option<&str>) -> Result<()> {
    let store = env.store();
    let credential = match (raw_token, url) {
        (Some(raw), _) => {
            let credential = Credential::new(raw).context("Token cannot be blank")?;
            store.save(&credential)?;
            credential
        }
        (None, Some(url)) => store.promote_from_url(url)?,
        (None, None) => {
            let login = format!(
                "{}/login",
                env.config.toml.client.dashboard_url.trim_end_matches('/')
            );
            println!("Sign in with Notion at {}", console::style(&login).cyan());
            println!("then run `crm login --url <the dashboard URL you land on>`.");
            if let Err(e) = open::that(&login) {
                tracing::debug!(error = %e, "could not open a browser");
            }
            return Ok(());
        }
    };

    // Invalid tokens are stored anyway; the backend is the judge.
    match token::inspect(credential.expose()) {
        Ok(claims) if !claims.is_expired_at(Utc::now()) => {
            println!(
                "{} Signed in as {}",
                console::style("✓").green(),
                console::style(&claims.email).bold()
            );
        }
        Ok(_) => println!("{} Token stored, but it has expired", console::style("⚠").yellow()),
        Err(e) => println!("{} Token stored, but {}", console::style("⚠").yellow(), e),
    }
    Ok(())
}

pub fn cmd_logout(env: &CliEnv) -> Result<()> {
    if env.store().clear()? {
        println!("Signed out.");
    } else {
        println!("Not signed in.");
    }
    Ok(())
}

pub async fn cmd_whoami(env: &CliEnv) -> Result<()> {
    let client = env.client()?;
    let user = client.current_user().await?;
    env.emit(&user, || {
        println!(
            "{} <{}>",
            user.name.as_deref().unwrap_or("(no name)"),
            user.email
        );
        println!("plan: {}", user.plan.as_str());
        if let Some(workspace) = &user.notion_workspace_id {
            println!("notion workspace: {}", workspace);
        }
    })
}
