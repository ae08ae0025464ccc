//! Integration tests for the agentbox CLI.
//!
//! These run the actual binary against the in-memory runtime and check
//! output, exit codes and file system effects.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the agentbox binary.
#[allow(deprecated)]
fn agentbox() -> Command {
    let mut cmd = Command::cargo_bin("agentbox").expect("failed to find agentbox binary");
    cmd.env_remove("AGENTBOX_CONFIG").env_remove("AGENTBOX_RUNTIME");
    cmd
}

/// Creates a Command running in `dir` against the memory runtime.
fn agentbox_in(dir: &TempDir) -> Command {
    let mut cmd = agentbox();
    cmd.current_dir(dir.path()).args(["--runtime", "memory"]);
    cmd
}

// -----------------------------------------------------------------------------
// Help and version
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    agentbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("agentbox"))
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("shell"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn test_version_shows_version() {
    agentbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_runtime_is_rejected() {
    agentbox()
        .args(["--runtime", "podman", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("podman"));
}

// -----------------------------------------------------------------------------
// init
// -----------------------------------------------------------------------------

#[test]
fn test_init_writes_config() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("agentbox.toml"));

    let content = fs::read_to_string(dir.path().join("agentbox.toml")).unwrap();
    assert!(content.contains("[sandbox]"));
    assert!(content.contains("[pool]"));
}

#[test]
fn test_init_keeps_existing_without_force() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agentbox.toml");
    fs::write(&path, "# mine\n").unwrap();

    agentbox_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("--force"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "# mine\n");

    agentbox_in(&dir).args(["init", "--force"]).assert().success();
    assert!(fs::read_to_string(&path).unwrap().contains("[sandbox]"));
}

// -----------------------------------------------------------------------------
// run
// -----------------------------------------------------------------------------

#[test]
fn test_run_prints_command_output() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .args(["run", "--", "echo hi", "echo there"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi\nthere\n"));
}

#[test]
fn test_run_exits_with_last_status() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .args(["run", "--", "false"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("exit status 1"));
}

#[test]
fn test_run_timeout_exits_124() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .args(["run", "--timeout", "1", "--", "sleep 30"])
        .assert()
        .code(124)
        .stderr(predicate::str::contains("timed out"));
}

#[test]
fn test_run_json_output() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .args(["run", "--json", "--", "cd /tmp", "pwd"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""stdout":"/tmp\n""#))
        .stdout(predicate::str::contains(r#""exit_code":0"#));
}

#[test]
fn test_run_moves_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("in.txt"), "data").unwrap();

    agentbox_in(&dir)
        .args([
            "run",
            "--put",
            "in.txt:/workspace/in.txt",
            "--get",
            "/workspace/out.txt:out.txt",
            "--",
            "cat in.txt > out.txt",
        ])
        .assert()
        .success();
    assert_eq!(
        fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "data"
    );
}

#[test]
fn test_run_without_commands_fails() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to do"));
}

#[test]
fn test_run_reads_config_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("agentbox.toml"),
        "[sandbox]\nwork_dir = \"/srv\"\n\n[runtime]\nbackend = \"memory\"\n",
    )
    .unwrap();

    agentbox()
        .current_dir(dir.path())
        .args(["run", "--", "pwd"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/srv"));
}

#[test]
fn test_run_with_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .args(["--config", "missing.toml", "run", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// -----------------------------------------------------------------------------
// status and clean
// -----------------------------------------------------------------------------

#[test]
fn test_status_reports_runtime() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("memory"))
        .stdout(predicate::str::contains("yes"));
}

#[test]
fn test_status_json() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""reachable": true"#));
}

#[test]
fn test_clean_with_nothing_to_remove() {
    let dir = TempDir::new().unwrap();
    agentbox_in(&dir)
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("No managed containers"));
}
