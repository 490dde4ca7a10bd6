//! Integration tests for the crm CLI
//!
//! Each test gets its own state directory through `CRM_HOME`, so stored
//! credentials and config files never leak between tests.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const SECRET: &str = "integration-secret-0123";

/// A crm Command isolated in `home`.
fn crm(home: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("crm");
    cmd.current_dir(home.path())
        .env("CRM_HOME", home.path())
        .env_remove("CRM_TOKEN")
        .env_remove("CRM_TOKEN_SECRET")
        .env_remove("CRM_API_URL")
        .env_remove("CRM_DB_PATH")
        .env_remove("CRM_LOG");
    cmd
}

fn issue_token(home: &TempDir, email: &str) -> String {
    let output = crm(home)
        .env("CRM_TOKEN_SECRET", SECRET)
        .args(["token", "issue", "--email", email])
        .output()
        .unwrap();
    assert!(output.status.success(), "{:?}", output);
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_crm_help() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("pipelines"))
            .stdout(predicate::str::contains("board"));
    }

    #[test]
    fn test_crm_version() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("crm"));
    }

    #[test]
    fn test_unknown_command_fails() {
        let home = TempDir::new().unwrap();
        crm(&home).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Session Tests
// =============================================================================

mod session {
    use super::*;

    #[test]
    fn test_token_issue_requires_secret() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .args(["token", "issue", "--email", "ada@example.com"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No token secret configured"));
    }

    #[test]
    fn test_token_issue_and_inspect() {
        let home = TempDir::new().unwrap();
        let token = issue_token(&home, "Ada@Example.com");
        assert_eq!(token.split('.').count(), 3);
        assert!(home.path().join("crm.db").exists());

        crm(&home)
            .args(["token", "inspect", &token])
            .assert()
            .success()
            .stdout(predicate::str::contains("ada@example.com"))
            .stdout(predicate::str::contains("valid"));
    }

    #[test]
    fn test_token_issue_reuses_user() {
        let home = TempDir::new().unwrap();
        let first = crm(&home)
            .env("CRM_TOKEN_SECRET", SECRET)
            .args(["--json", "token", "issue", "--email", "ada@example.com"])
            .output()
            .unwrap();
        let second = crm(&home)
            .env("CRM_TOKEN_SECRET", SECRET)
            .args(["--json", "token", "issue", "--email", "ada@example.com"])
            .output()
            .unwrap();
        let first: serde_json::Value = serde_json::from_slice(&first.stdout).unwrap();
        let second: serde_json::Value = serde_json::from_slice(&second.stdout).unwrap();
        assert_eq!(first["userId"], second["userId"]);
    }

    #[test]
    fn test_login_from_url_then_logout() {
        let home = TempDir::new().unwrap();
        let token = issue_token(&home, "ada@example.com");
        let url = format!("http://localhost:3000/dashboard?token={}", token);

        crm(&home)
            .args(["login", "--url", &url])
            .assert()
            .success()
            .stdout(predicate::str::contains("Signed in as ada@example.com"));

        let stored = fs::read_to_string(home.path().join("credentials")).unwrap();
        assert!(stored.starts_with(&format!("token={};", token)));

        // Inspect falls back to the stored token.
        crm(&home)
            .args(["token", "inspect"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ada@example.com"));

        crm(&home)
            .arg("logout")
            .assert()
            .success()
            .stdout(predicate::str::contains("Signed out."));
        crm(&home)
            .arg("logout")
            .assert()
            .success()
            .stdout(predicate::str::contains("Not signed in."));
    }

    #[test]
    fn test_login_url_without_token_fails() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .args(["login", "--url", "http://localhost:3000/dashboard"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("no 'token' parameter"));
        assert!(!home.path().join("credentials").exists());
    }

    #[test]
    fn test_commands_need_a_session() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .args(["pipelines", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Not signed in"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_hides_secrets() {
        let home = TempDir::new().unwrap();
        fs::write(
            home.path().join("crm.toml"),
            "[server]\ntoken_secret = \"super-secret-value-123\"\nport = 4100\n",
        )
        .unwrap();

        crm(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4100"))
            .stdout(predicate::str::contains("super-secret-value-123").not());
    }

    #[test]
    fn test_config_validate() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));

        fs::write(
            home.path().join("crm.toml"),
            "[client]\napi_url = \"not a url\"\npage_size = 0\n",
        )
        .unwrap();
        crm(&home)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("client.api_url is not a valid URL"))
            .stdout(predicate::str::contains("client.page_size must be at least 1"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let home = TempDir::new().unwrap();
        crm(&home)
            .args(["--config", "nowhere.toml", "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Config file not found"));
    }
}

// =============================================================================
// Against a running backend
// =============================================================================

mod against_server {
    use super::*;
    use crm::server::{ServerConfig, spawn};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipeline_deal_and_board_commands() {
        let home = TempDir::new().unwrap();
        let server = spawn(ServerConfig {
            port: 0,
            dashboard_port: 0,
            db_path: home.path().join("crm.db"),
            token_secret: SECRET.into(),
            ..ServerConfig::default()
        })
        .await
        .unwrap();
        let api = server.api_url();
        let token = issue_token(&home, "ada@example.com");

        let run = |args: &[&str]| {
            crm(&home)
                .env("CRM_TOKEN", &token)
                .args(["--api-url", &api])
                .args(args)
                .assert()
        };

        let out = run(&["--json", "pipelines", "create", "Sales", "--stages", "Lead,Won"])
            .success()
            .get_output()
            .stdout
            .clone();
        let pipeline: crm_common::Pipeline = serde_json::from_slice(&out).unwrap();
        let stages: Vec<i64> = pipeline.ordered_stages().iter().map(|s| s.id).collect();
        let pid = pipeline.id.to_string();

        let out = run(&[
            "--json", "deals", "create", "Big one", "--pipeline", &pid, "--value", "1200",
            "--field", "priority=high",
        ])
        .success()
        .get_output()
        .stdout
        .clone();
        let deal: crm_common::Deal = serde_json::from_slice(&out).unwrap();
        assert_eq!(deal.stage_id, stages[0]);

        run(&["deals", "create", "Bad", "--pipeline", &pid, "--value=-5"])
            .failure()
            .stderr(predicate::str::contains("Must be zero or more"));

        run(&["deals", "move", &deal.id.to_string(), "--stage", &stages[1].to_string()])
            .success()
            .stdout(predicate::str::contains(format!("stage {}", stages[1])));

        run(&["board", &pid])
            .success()
            .stdout(predicate::str::contains("Sales"))
            .stdout(predicate::str::contains("Big one"))
            .stdout(predicate::str::contains("1 · 1200.00"));

        run(&["whoami"])
            .success()
            .stdout(predicate::str::contains("ada@example.com"));

        run(&["tags", "create", "vip", "--color", "#00ff00"])
            .success()
            .stdout(predicate::str::contains("#00FF00"));

        run(&["pipelines", "delete", &pid]).success();
        run(&["pipelines", "list"])
            .success()
            .stdout(predicate::str::contains("No pipelines."));

        server.shutdown().await.unwrap();
    }
}
