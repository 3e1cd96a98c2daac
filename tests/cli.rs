use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docmirror_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docmirror"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docmirror.sqlite"

[storage]
provider = "filesystem"
root = "{root}/data/blobs"

[github]
api_url = "http://127.0.0.1:9"
max_attempts = 1
timeout_secs = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docmirror.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docmirror(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docmirror_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("GITHUB_TOKEN")
        .env_remove("OPENAI_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docmirror binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docmirror(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/docmirror.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_docmirror(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_docmirror(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_status_with_no_projects() {
    let (_tmp, config_path) = setup_test_env();
    run_docmirror(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docmirror(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("No projects tracked."));
    assert!(stdout.contains("queue: 0 pending, 0 running, 0 done, 0 error"));
}

#[test]
fn test_sweep_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_docmirror(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docmirror(&config_path, &["sweep"]);
    assert!(success, "sweep failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("chunks deleted: 0"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_worker_once_on_empty_queue() {
    let (_tmp, config_path) = setup_test_env();
    run_docmirror(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docmirror(&config_path, &["worker", "--once"]);
    assert!(success, "worker failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("claimed: 0"));
}

#[test]
fn test_rescan_untracked_repo_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_docmirror(&config_path, &["init"]);

    let (_, stderr, success) = run_docmirror(&config_path, &["rescan", "acme/handbook"]);
    assert!(!success, "rescan of an untracked repo should fail");
    assert!(stderr.contains("not tracked"));
}

#[test]
fn test_hook_install_requires_public_url() {
    let (_tmp, config_path) = setup_test_env();
    run_docmirror(&config_path, &["init"]);

    let (_, stderr, success) = run_docmirror(&config_path, &["hook", "install", "acme/handbook"]);
    assert!(!success);
    assert!(stderr.contains("public_url"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_docmirror(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
