use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docrag_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_docrag"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("paris.txt"),
        "Paris is the capital of France. It is located on the Seine.",
    )
    .unwrap();
    fs::write(
        files_dir.join("rust.md"),
        "# Rust\n\nRust is a systems programming language.\n\nIt has ownership and borrowing.\n\nCargo builds crates.",
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
root = "{}/data"

[chunking]
chunk_size = 30
chunk_overlap = 5
min_chunk_size = 1

[server]
bind = "127.0.0.1:7399"
"#,
        root.display()
    );

    let config_path = config_dir.join("docrag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docrag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docrag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docrag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .to_string_lossy()
        .to_string()
}

#[test]
fn test_split_stores_chunks() {
    let (tmp, config_path) = setup_test_env();

    let paris = file(&config_path, "paris.txt");
    let (stdout, stderr, success) = run_docrag(&config_path, &["split", &paris]);
    assert!(success, "split failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Split"));
    assert!(stdout.contains("paris"));

    assert!(tmp.path().join("data/chunks/paris.json").exists());
    assert!(tmp
        .path()
        .join("data/chunk_metadata/paris_metadata.json")
        .exists());
}

#[test]
fn test_split_json_statistics() {
    let (_tmp, config_path) = setup_test_env();

    let paris = file(&config_path, "paris.txt");
    let (stdout, _, success) =
        run_docrag(&config_path, &["--json", "split", &paris, "--id", "fr"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["document_id"], "fr");
    assert_eq!(stats["total_chunks"], 4);
    assert!(stats["min_chunk_size"].as_u64().unwrap() > 0);
}

#[test]
fn test_chunks_in_order_with_paging() {
    let (_tmp, config_path) = setup_test_env();

    let rust = file(&config_path, "rust.md");
    run_docrag(&config_path, &["split", &rust]);

    let (stdout, _, success) = run_docrag(&config_path, &["--json", "chunks", "rust"]);
    assert!(success);
    let chunks: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert!(chunks.len() > 1);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk["chunk_index"], i);
        assert_eq!(chunk["document_id"], "rust");
    }

    let (stdout, _, _) = run_docrag(
        &config_path,
        &["--json", "chunks", "rust", "--limit", "1", "--offset", "1"],
    );
    let page: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["chunk_index"], 1);
}

#[test]
fn test_split_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();

    let rust = file(&config_path, "rust.md");
    run_docrag(&config_path, &["split", &rust]);
    let (first, _, _) = run_docrag(&config_path, &["--json", "chunks", "rust"]);
    run_docrag(&config_path, &["split", &rust]);
    let (second, _, _) = run_docrag(&config_path, &["--json", "chunks", "rust"]);

    let ids = |s: &str| -> Vec<String> {
        serde_json::from_str::<Vec<serde_json::Value>>(s)
            .unwrap()
            .iter()
            .map(|c| c["chunk_id"].as_str().unwrap().to_string())
            .collect()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[test]
fn test_stats_lists_documents() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["split", &file(&config_path, "paris.txt")]);
    run_docrag(&config_path, &["split", &file(&config_path, "rust.md")]);

    let (stdout, _, success) = run_docrag(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   2"));
    assert!(stdout.contains("paris"));
    assert!(stdout.contains("rust"));

    let (stdout, _, success) = run_docrag(&config_path, &["--json", "stats", "paris"]);
    assert!(success);
    let docs: Vec<serde_json::Value> = serde_json::from_str(&stdout).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["document_id"], "paris");
}

#[test]
fn test_indexes_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_docrag(&config_path, &["indexes"]);
    assert!(success);
    assert!(stdout.contains("No indexes"));
}

#[test]
fn test_delete_twice() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["split", &file(&config_path, "paris.txt")]);

    let (stdout, _, success) = run_docrag(&config_path, &["delete", "paris"]);
    assert!(success);
    assert!(stdout.contains("Deleted paris"));

    let (stdout, _, success) = run_docrag(&config_path, &["delete", "paris"]);
    assert!(success, "second delete should not fail");
    assert!(stdout.contains("Nothing to delete"));

    let (_, _, success) = run_docrag(&config_path, &["chunks", "paris"]);
    assert!(!success, "chunks of a deleted document should fail");
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_docrag(&config_path, &["search", ""]);
    assert!(success, "Empty query should not fail");
    assert!(stdout.contains("No results"));
}

#[test]
fn test_embed_requires_provider() {
    let (_tmp, config_path) = setup_test_env();

    run_docrag(&config_path, &["split", &file(&config_path, "paris.txt")]);
    let (_, stderr, success) = run_docrag(&config_path, &["embed", "paris"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "stderr: {}", stderr);
}

#[test]
fn test_rejects_invalid_document_id() {
    let (_tmp, config_path) = setup_test_env();

    let paris = file(&config_path, "paris.txt");
    let (_, stderr, success) = run_docrag(&config_path, &["split", &paris, "--id", "../escape"]);
    assert!(!success);
    assert!(stderr.contains("invalid document id"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[chunking]\nchunk_size = 10\nchunk_overlap = 10\n").unwrap();

    let (_, stderr, success) = run_docrag(&bad, &["indexes"]);
    assert!(!success);
    assert!(stderr.contains("chunking"), "stderr: {}", stderr);
}

#[test]
fn test_missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_docrag(&missing, &["indexes"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
