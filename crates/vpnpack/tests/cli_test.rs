//! Integration tests for the `vpnpack` binary.
//!
//! Covers argument parsing, config handling, key generation, and
//! completions. Nothing here touches netlink or the network.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// A `vpnpack` command isolated from the caller's environment and pointed
/// at `config`.
fn vpnpack_cmd(config: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("vpnpack");
    cmd.env_remove("VPNPACK_CONFIG")
        .env_remove("VPNPACK_OUTPUT")
        .env_remove("VPNPACK_API_KEY")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config);
    cmd
}

fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vpnpack.toml");
    (dir, path)
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = cargo_bin_cmd!("vpnpack").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "Expected 'Usage' in:\n{stderr}");
}

#[test]
fn test_help_lists_commands() {
    cargo_bin_cmd!("vpnpack")
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("WireGuard")
                .and(predicate::str::contains("cleanup"))
                .and(predicate::str::contains("peer-config"))
                .and(predicate::str::contains("status")),
        );
}

#[test]
fn test_unknown_output_format_is_usage_error() {
    let (_dir, path) = scratch();
    vpnpack_cmd(&path)
        .args(["-o", "yaml", "keygen"])
        .assert()
        .code(2);
}

// ── Keygen ──────────────────────────────────────────────────────────

#[test]
fn test_keygen_json() {
    let (_dir, path) = scratch();
    let output = vpnpack_cmd(&path)
        .args(["-o", "json", "keygen"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let private = value["privateKey"].as_str().unwrap();
    let public = value["publicKey"].as_str().unwrap();
    assert_eq!(private.len(), 44);
    assert_eq!(public.len(), 44);
    assert_ne!(private, public);
}

#[test]
fn test_keygen_plain_prints_two_lines() {
    let (_dir, path) = scratch();
    let output = vpnpack_cmd(&path)
        .args(["-o", "plain", "keygen"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 2);
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_echoes_flag() {
    let (_dir, path) = scratch();
    vpnpack_cmd(&path)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("vpnpack.toml"));
}

#[test]
fn test_config_init_then_show() {
    let (_dir, path) = scratch();
    vpnpack_cmd(&path)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote default config"));
    assert!(path.exists());

    vpnpack_cmd(&path)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));

    vpnpack_cmd(&path)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[integration]")
                .and(predicate::str::contains("poll_interval_secs")),
        );
}

#[test]
fn test_config_show_json_reflects_file() {
    let (_dir, path) = scratch();
    std::fs::write(&path, "[watcher]\npoll_interval_secs = 90\n").unwrap();
    let output = vpnpack_cmd(&path)
        .args(["-o", "json", "config", "show"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["watcher"]["poll_interval_secs"], 90);
}

#[test]
fn test_invalid_config_names_field() {
    let (_dir, path) = scratch();
    std::fs::write(&path, "[integration]\ntimeout_secs = 0\n").unwrap();
    vpnpack_cmd(&path)
        .args(["config", "show"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("integration.timeout_secs"));
}

// ── Cleanup ─────────────────────────────────────────────────────────

#[test]
fn test_cleanup_without_tty_requires_yes() {
    let (_dir, path) = scratch();
    vpnpack_cmd(&path)
        .arg("cleanup")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("requires confirmation"));
}

// ── Completions ─────────────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    let (_dir, path) = scratch();
    vpnpack_cmd(&path)
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("vpnpack"));
}

#[test]
fn test_completions_invalid_shell() {
    let (_dir, path) = scratch();
    vpnpack_cmd(&path)
        .args(["completions", "tcsh"])
        .assert()
        .failure();
}
