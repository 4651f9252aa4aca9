//! CLI Integration Tests
//!
//! These tests verify the CLI commands work correctly end-to-end.
//! They test the "wiring" between the CLI and the core library.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("travelerhub").expect("Failed to find travelerhub binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

// ============================================================================
// Demo Command Tests
// ============================================================================

#[test]
fn test_demo_prints_synced_caches() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("demo")
        .assert()
        .success()
        .stdout(predicate::str::contains("TravelerHub demo"))
        .stdout(predicate::str::contains("ana: Olá! Coffee at the market?"))
        .stdout(predicate::str::contains("bo: Sure, see you at 10"))
        .stdout(predicate::str::contains("Senhora do Monte"))
        .stdout(predicate::str::contains("Favorites: 1"));
}

#[test]
fn test_demo_persists_caches() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).arg("demo").assert().success();
    assert!(data_dir.path().join("cache.redb").exists());

    cli_cmd(&data_dir)
        .args(["cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chat-storage: 2 items"))
        .stdout(predicate::str::contains("posts-storage: 1 items"))
        .stdout(predicate::str::contains("interests-storage: 1 items"));
}

// ============================================================================
// Cache Command Tests
// ============================================================================

#[test]
fn test_cache_list_without_data() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted caches."));
}

#[test]
fn test_cache_clear_removes_everything() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir).arg("demo").assert().success();

    cli_cmd(&data_dir)
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared"));

    cli_cmd(&data_dir)
        .args(["cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted caches."));
}

#[test]
fn test_data_dir_from_environment() {
    let data_dir = TempDir::new().unwrap();

    Command::cargo_bin("travelerhub")
        .unwrap()
        .env("TRAVELERHUB_DATA_DIR", data_dir.path())
        .args(["cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted caches."));
}

#[test]
fn test_unknown_command_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("teleport")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}
