//! Configuration view and validation commands: `crm config`.

use anyhow::{Context, Result};

use super::CliEnv;
use crate::ConfigCommands;

pub fn cmd_config(env: &CliEnv, command: Option<ConfigCommands>) -> Result<()> {
    let config = &env.config;

    match command {
        None | Some(ConfigCommands::Show) => {
            // Never print secrets.
            let mut shown = config.toml.clone();
            if shown.server.token_secret.is_some() {
                shown.server.token_secret = Some("********".into());
            }
            if shown.notion.client_secret.is_some() {
                shown.notion.client_secret = Some("********".into());
            }

            if env.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&shown).context("Failed to serialize config")?
                );
                return Ok(());
            }

            println!();
            println!("{}", console::style("CRM Configuration").bold().cyan());
            println!();
            match &config.source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No crm.toml found, using defaults"),
            }
            println!("State dir:   {}", config.state_dir.display());
            println!("Database:    {}", config.db_path().display());
            println!();
            print!(
                "{}",
                toml::to_string_pretty(&shown).context("Failed to render config")?
            );
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!(
                "  signed in = {}",
                env.credential()?.is_some()
            );
            println!(
                "  notion configured = {}",
                config.toml.notion.is_configured()
            );
            Ok(())
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.toml.validate();
            if problems.is_empty() {
                println!("{} Configuration is valid", console::style("✓").green());
                return Ok(());
            }
            for problem in &problems {
                println!("  {} {}", console::style("✗").red(), problem);
            }
            anyhow::bail!("{} configuration problem(s)", problems.len())
        }
    }
}
