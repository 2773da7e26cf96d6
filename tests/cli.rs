use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kbh_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbh"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let docs_dir = root.join("docs");
    fs::create_dir_all(&docs_dir).unwrap();
    fs::write(
        docs_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt covers cargo and crates.",
    )
    .unwrap();
    fs::write(
        docs_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nNotes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[paths]
docs_dir = "{root}/docs"
data_dir = "{root}/data"

[chunking]
max_tokens = 200

[embedding]
provider = "hash"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("kbh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kbh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(kbh_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("Failed to run kbh binary");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_ingest_then_reload() {
    let (_tmp, config) = setup_test_env();

    let (stdout, stderr, success) = run_kbh(&config, &["ingest"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("files: 2"));
    assert!(stdout.contains("rebuilt"));

    let (stdout, _, success) = run_kbh(&config, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("loaded (unchanged)"));

    let (stdout, _, success) = run_kbh(&config, &["ingest", "--force"]);
    assert!(success);
    assert!(stdout.contains("rebuilt"));
}

#[test]
fn test_lexical_search() {
    let (_tmp, config) = setup_test_env();

    let (stdout, stderr, success) = run_kbh(&config, &["search", "kubernetes docker", "--mode", "lexical"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("gamma.txt"));
    assert!(!stdout.contains("alpha.md"));
}

#[test]
fn test_search_rejects_unknown_mode() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_kbh(&config, &["search", "rust", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"));
}

#[test]
fn test_files_list_add_remove() {
    let (tmp, config) = setup_test_env();

    let (stdout, _, success) = run_kbh(&config, &["files", "list"]);
    assert!(success);
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("gamma.txt"));

    let extra = tmp.path().join("delta.md");
    fs::write(&extra, "Delta covers observability.").unwrap();
    let (stdout, stderr, success) = run_kbh(&config, &["files", "add", extra.to_str().unwrap()]);
    assert!(success, "add failed: {}", stderr);
    assert!(stdout.contains("files: 3"));
    assert!(tmp.path().join("docs/delta.md").exists());

    let (stdout, stderr, success) = run_kbh(&config, &["files", "remove", "alpha.md"]);
    assert!(success, "remove failed: {}", stderr);
    assert!(stdout.contains("files: 2"));
    assert!(!tmp.path().join("docs/alpha.md").exists());
}

#[test]
fn test_status_and_index_clear() {
    let (_tmp, config) = setup_test_env();

    let (stdout, _, success) = run_kbh(&config, &["status"]);
    assert!(success);
    assert!(stdout.contains("not built"));

    run_kbh(&config, &["ingest"]);
    let (stdout, _, success) = run_kbh(&config, &["status"]);
    assert!(success);
    assert!(stdout.contains("hash-256"));
    assert!(stdout.contains("Files:       2"));

    let (stdout, _, success) = run_kbh(&config, &["index", "clear"]);
    assert!(success);
    assert!(stdout.contains("Index cleared."));

    let (stdout, _, _) = run_kbh(&config, &["status"]);
    assert!(stdout.contains("not built"));
}

#[test]
fn test_session_lifecycle() {
    let (tmp, config) = setup_test_env();

    let (stdout, _, success) = run_kbh(&config, &["session", "new", "--title", "ops"]);
    assert!(success);
    let id = stdout.trim().to_string();
    assert!(!id.is_empty());

    let (stdout, _, _) = run_kbh(&config, &["session", "list"]);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("ops"));

    let dest = tmp.path().join("export.json");
    let (_, stderr, success) = run_kbh(
        &config,
        &["session", "export", &id, "--output", dest.to_str().unwrap()],
    );
    assert!(success, "export failed: {}", stderr);
    assert!(fs::read_to_string(&dest).unwrap().contains("\"ops\""));

    let (stdout, _, _) = run_kbh(&config, &["session", "delete", &id]);
    assert!(stdout.contains("Deleted session"));

    let (_, _, success) = run_kbh(&config, &["session", "show", &id]);
    assert!(!success);
}

#[test]
fn test_cache_info_on_empty_cache() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_kbh(&config, &["cache", "info"]);
    assert!(success);
    assert!(stdout.contains("entries: 0"));

    let (stdout, _, success) = run_kbh(&config, &["cache", "clear"]);
    assert!(success);
    assert!(stdout.contains("removed 0 entries"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_kbh(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
