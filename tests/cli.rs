//! Integration tests for the `relay` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// A relay command isolated from the caller's environment.
fn relay(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("relay");
    cmd.current_dir(dir.path())
        .env_remove("RELAY_DB_PATH")
        .env_remove("RELAY_BIND")
        .env_remove("RELAY_CONFIG")
        .env_remove("RELAY_INTERNAL_SECRET")
        .env("RUST_LOG", "warn");
    cmd
}

fn initialized() -> TempDir {
    let dir = TempDir::new().unwrap();
    relay(&dir).arg("init").assert().success();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        relay(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("submit"))
            .stdout(predicate::str::contains("sweep"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        relay(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_config_and_store() {
        let dir = TempDir::new().unwrap();
        relay(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized relay"));
        assert!(dir.path().join(".relay/relay.toml").exists());
        assert!(dir.path().join(".relay/relay.db").exists());

        relay(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Config already exists"));
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        relay(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("lease_ttl_secs = 300"));
    }

    #[test]
    fn test_config_validate_warns_about_missing_secret() {
        let dir = initialized();
        relay(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("RELAY_INTERNAL_SECRET is not set"));

        relay(&dir)
            .args(["config", "validate"])
            .env("RELAY_INTERNAL_SECRET", "s")
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_init_refuses_to_overwrite() {
        let dir = initialized();
        relay(&dir)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));
        relay(&dir)
            .args(["config", "init", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn test_env_overrides_store_path() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("elsewhere.db");
        relay(&dir)
            .arg("init")
            .env("RELAY_DB_PATH", &db)
            .assert()
            .success();
        assert!(db.exists());
    }
}

mod run_commands {
    use super::*;

    #[test]
    fn test_submit_status_cancel() {
        let dir = initialized();
        relay(&dir)
            .args(["submit", r#"{"question":"why"}"#])
            .assert()
            .success()
            .stdout(predicate::str::contains("Submitted run 1"));

        relay(&dir)
            .args(["status", "1", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""status": "queued""#))
            .stdout(predicate::str::contains("why"));

        relay(&dir)
            .arg("queue")
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"pending\s+1").unwrap());

        relay(&dir)
            .args(["cancel", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cancelled run 1"));
        relay(&dir)
            .args(["cancel", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already cancelled"));
    }

    #[test]
    fn test_status_of_unknown_run_fails() {
        let dir = initialized();
        relay(&dir)
            .args(["status", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("42"));
    }

    #[test]
    fn test_sweep_with_nothing_expired() {
        let dir = initialized();
        relay(&dir)
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("No expired barriers"));
    }
}
