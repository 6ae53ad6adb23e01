//! The `capwire` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn capwire(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("capwire").unwrap();
    cmd.env("HOME", home.path()).env_remove("RUST_LOG");
    cmd
}

#[test]
fn demo_prints_rows_in_age_order() {
    let home = TempDir::new().unwrap();
    capwire(&home)
        .arg("demo")
        .assert()
        .success()
        .stdout("Alice (30)\nBob (31)\nCharlie (32)\n");
}

#[test]
fn demo_filters_and_prints_json() {
    let home = TempDir::new().unwrap();
    capwire(&home)
        .args(["demo", "--min-age", "31", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"Bob\""))
        .stdout(predicate::str::contains("\"Charlie\""))
        .stdout(predicate::str::contains("Alice").not());
}

#[test]
fn config_file_is_honoured() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("capwire.toml");
    std::fs::write(&path, "[session]\nresolve_timeout_ms = 5000\nmax_graph_depth = 8\n").unwrap();

    capwire(&home)
        .arg("--config")
        .arg(&path)
        .arg("demo")
        .assert()
        .success()
        .stdout(predicate::str::contains("Charlie (32)"));
}

#[test]
fn invalid_config_fails() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("capwire.toml");
    std::fs::write(&path, "[session]\nmax_graph_depth = 0\n").unwrap();

    capwire(&home)
        .arg("--config")
        .arg(&path)
        .arg("demo")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_graph_depth"));
}

#[test]
fn missing_config_fails() {
    let home = TempDir::new().unwrap();
    capwire(&home)
        .args(["--config", "/nonexistent/capwire.toml", "demo"])
        .assert()
        .failure();
}
