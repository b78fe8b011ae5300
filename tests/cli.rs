use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Config pointing storage into the temp dir. The Ollama provider is only
/// contacted when something needs embedding, which these tests avoid.
fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let source = root.join("docs");
    fs::create_dir_all(&source).unwrap();

    let config_content = format!(
        r#"[storage]
root = "{}/state"

[defaults]
embedding_model = "nomic-embed-text"

[embedding]
provider = "ollama"
url = "http://127.0.0.1:9"
max_retries = 0
"#,
        root.display()
    );
    let config_path = root.join("ksync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, source)
}

fn run_ksync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_ksync"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run ksync");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_refresh_empty_directory() {
    let (_tmp, config, source) = setup_test_env();
    let (stdout, stderr, ok) = run_ksync(&config, &["--json", "refresh", source.to_str().unwrap()]);
    assert!(ok, "refresh failed: {}", stderr);

    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["documents_added"], 0);
    assert_eq!(summary["errors"], serde_json::json!([]));
}

#[test]
fn test_stats_reports_empty_knowledge_base() {
    let (tmp, config, source) = setup_test_env();
    let (stdout, stderr, ok) = run_ksync(&config, &["--json", "stats", source.to_str().unwrap()]);
    assert!(ok, "stats failed: {}", stderr);

    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["documents"], 0);
    assert_eq!(stats["embedding_model"], "nomic-embed-text");
    assert!(tmp.path().join("state").is_dir());
}

#[test]
fn test_refresh_missing_directory_fails() {
    let (tmp, config, _) = setup_test_env();
    let missing = tmp.path().join("nope");
    let (_, stderr, ok) = run_ksync(&config, &["refresh", missing.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("invalid source path"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_overrides_fail() {
    let (_tmp, config, source) = setup_test_env();
    let (_, stderr, ok) = run_ksync(
        &config,
        &[
            "refresh",
            source.to_str().unwrap(),
            "--chunk-size",
            "10",
            "--chunk-overlap",
            "10",
        ],
    );
    assert!(!ok);
    assert!(stderr.contains("invalid configuration"), "stderr: {}", stderr);
}

#[test]
fn test_bad_config_is_rejected() {
    let (tmp, _, source) = setup_test_env();
    let config = tmp.path().join("bad.toml");
    fs::write(&config, "[embedding]\nprovider = \"bogus\"\n").unwrap();
    let (_, stderr, ok) = run_ksync(&config, &["stats", source.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("Unknown embedding provider"), "stderr: {}", stderr);
}
