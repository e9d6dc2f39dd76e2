//! Integration tests for the syncpair CLI commands
//!
//! These run the compiled binary with its config and data directories
//! redirected into a temporary directory.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn syncpair(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_syncpair"))
        .args(args)
        .env("SYNCPAIR_CONFIG_DIR", home.join("config"))
        .env("SYNCPAIR_DATA_DIR", home.join("data"))
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "syncpair=warn")
        .output()
        .expect("failed to run syncpair binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_cli_init_command() {
    let temp_dir = TempDir::new().unwrap();

    let output = syncpair(temp_dir.path(), &["init"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("Configuration written"));
    assert!(temp_dir.path().join("config/config.toml").exists());
}

#[test]
fn test_cli_status_on_fresh_node() {
    let temp_dir = TempDir::new().unwrap();

    let output = syncpair(temp_dir.path(), &["status"]);

    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Not paired"));
    assert!(text.contains("No sync folder selected"));
    assert!(text.contains("Last sync: never"));
    assert!(text.contains(":6666"));
}

#[test]
fn test_cli_folder_then_status() {
    let temp_dir = TempDir::new().unwrap();
    let folder = temp_dir.path().join("shared");
    std::fs::create_dir(&folder).unwrap();
    std::fs::write(folder.join("a.txt"), b"a").unwrap();
    std::fs::write(folder.join("b.txt"), b"b").unwrap();

    let output = syncpair(temp_dir.path(), &["folder", folder.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("2 file(s)"));
    assert!(temp_dir.path().join("data/state.json").exists());

    let status = stdout(&syncpair(temp_dir.path(), &["status"]));
    assert!(status.contains("shared"));
    assert!(status.contains("2 files tracked"));
}

#[test]
fn test_cli_folder_missing_directory_fails() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope");

    let output = syncpair(temp_dir.path(), &["folder", missing.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn test_cli_port_command() {
    let temp_dir = TempDir::new().unwrap();

    let output = syncpair(temp_dir.path(), &["port", "7123"]);
    assert!(output.status.success());

    let status = stdout(&syncpair(temp_dir.path(), &["status"]));
    assert!(status.contains(":7123"));
}

#[test]
fn test_cli_rejects_privileged_port() {
    let temp_dir = TempDir::new().unwrap();

    let output = syncpair(temp_dir.path(), &["port", "80"]);

    assert!(!output.status.success());
    assert!(!temp_dir.path().join("data/state.json").exists());
}

#[test]
fn test_cli_explicit_state_file() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("elsewhere.json");

    let output = syncpair(
        temp_dir.path(),
        &["--state", state.to_str().unwrap(), "port", "7200"],
    );

    assert!(output.status.success());
    assert!(state.exists());
    assert!(!temp_dir.path().join("data/state.json").exists());
}
