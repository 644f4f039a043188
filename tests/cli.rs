//! Runs the compiled `eds` binary against a temporary configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn eds_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_eds"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("alpha.md"),
        "# Alpha Guide\n\nThe alpha service stores uploads by content hash.\n\n## Limits\n\nUploads above the size limit are rejected.",
    )
    .unwrap();
    fs::write(
        docs.join("beta.txt"),
        "Beta notes.\n\nWorkers pick tasks from a fair queue.\n\nCancelled tasks stop at the next checkpoint.",
    )
    .unwrap();
    fs::write(docs.join("image.png"), [0x89, b'P', b'N', b'G', 0, 0]).unwrap();

    let config_content = format!(
        r#"[app]
database_url = "sqlite:{root}/data/eds.sqlite"
upload_dir = "{root}/uploads"
log_level = "warn"

[tasks]
max_concurrent_tasks = 2
"#,
        root = root.display()
    );
    let config_path = config_dir.join("easy-dataset.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_eds(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    run_eds_with_env(config_path, args, &[])
}

fn run_eds_with_env(
    config_path: &Path,
    args: &[&str],
    env: &[(&str, &str)],
) -> (String, String, bool) {
    let binary = eds_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .envs(env.iter().copied())
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run eds binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn create_project(config: &Path) -> String {
    let (stdout, stderr, success) = run_eds(config, &["project", "create", "handbook"]);
    assert!(success, "project create failed: {}", stderr);
    stdout.trim().to_string()
}

/// `id<TAB>name` lines printed by `upload`, keyed by file name.
fn uploaded_ids(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|l| l.split_once('\t'))
        .map(|(id, name)| (name.to_string(), id.to_string()))
        .collect()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_eds(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/eds.sqlite").exists());
    assert!(tmp.path().join("uploads").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_eds(&config, &["init"]);
    let (_, stderr, second) = run_eds(&config, &["init"]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_project_create_and_list() {
    let (_tmp, config) = setup_test_env();
    run_eds(&config, &["init"]);
    let id = create_project(&config);
    assert!(!id.is_empty());

    let (stdout, _, success) = run_eds(&config, &["project", "list"]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("handbook"));
}

#[test]
fn test_upload_directory_chunks_supported_files() {
    let (tmp, config) = setup_test_env();
    run_eds(&config, &["init"]);
    let project = create_project(&config);
    let docs = tmp.path().join("docs");

    let (stdout, stderr, success) =
        run_eds(&config, &["upload", &project, docs.to_str().unwrap()]);
    assert!(success, "upload failed: {}", stderr);
    let ids = uploaded_ids(&stdout);
    let names: Vec<&str> = ids.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"alpha.md"));
    assert!(names.contains(&"beta.txt"));
    assert!(!names.contains(&"image.png"));

    let alpha = &ids.iter().find(|(n, _)| n == "alpha.md").unwrap().1;
    let (chunks, _, success) = run_eds(&config, &["chunks", alpha]);
    assert!(success);
    assert!(chunks.lines().count() >= 1);
    assert!(chunks.contains("alpha-part-1"));
    assert!(chunks.contains("Alpha Guide"));

    let (tasks, _, success) = run_eds(&config, &["task", "list", "--project", &project]);
    assert!(success);
    let processing: Vec<&str> = tasks
        .lines()
        .filter(|l| l.contains("file_processing"))
        .collect();
    assert_eq!(processing.len(), 2);
    assert!(processing.iter().all(|l| l.contains("succeeded")));
}

#[test]
fn test_upload_same_file_reuses_id() {
    let (tmp, config) = setup_test_env();
    run_eds(&config, &["init"]);
    let project = create_project(&config);
    let file = tmp.path().join("docs/beta.txt");

    let (first, _, ok1) = run_eds(&config, &["upload", &project, file.to_str().unwrap()]);
    let (second, _, ok2) = run_eds(&config, &["upload", &project, file.to_str().unwrap()]);
    assert!(ok1 && ok2);
    assert_eq!(uploaded_ids(&first), uploaded_ids(&second));

    let stored = walkdir::WalkDir::new(tmp.path().join("uploads"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(stored, 1);
}

#[test]
fn test_generate_without_model_fails() {
    let (tmp, config) = setup_test_env();
    run_eds(&config, &["init"]);
    let project = create_project(&config);
    let file = tmp.path().join("docs/alpha.md");
    run_eds(&config, &["upload", &project, file.to_str().unwrap()]);

    let (_, stderr, success) = run_eds(&config, &["generate", "questions", &project]);
    assert!(!success);
    assert!(stderr.contains("no model given"), "stderr: {}", stderr);

    let (_, stderr, success) = run_eds(
        &config,
        &["generate", "questions", &project, "--provider", "local"],
    );
    assert!(!success);
    assert!(stderr.contains("--provider and --model"), "stderr: {}", stderr);
}

#[test]
fn test_dataset_export_freezes_snapshot() {
    let (tmp, config) = setup_test_env();
    run_eds(&config, &["init"]);
    let project = create_project(&config);

    let (stdout, stderr, success) =
        run_eds(&config, &["dataset", "create", &project, "empty-v1"]);
    assert!(success, "dataset create failed: {}", stderr);
    let dataset = stdout.trim().to_string();

    let out = tmp.path().join("out/empty.jsonl");
    let (_, stderr, success) = run_eds(
        &config,
        &["export", &dataset, "--format", "jsonl", "--out", out.to_str().unwrap()],
    );
    assert!(success, "export failed: {}", stderr);
    assert_eq!(fs::read_to_string(&out).unwrap().lines().count(), 0);

    let (shown, _, success) = run_eds(&config, &["dataset", "show", &dataset]);
    assert!(success);
    let shown: Value = serde_json::from_str(&shown).unwrap();
    assert_eq!(shown["status"], "exported");
    assert_eq!(shown["entry_count"], 0);

    let (_, stderr, success) = run_eds(&config, &["dataset", "snapshot", &dataset]);
    assert!(!success);
    assert!(stderr.contains("immutable"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_uses_environment() {
    let tmp = TempDir::new().unwrap();
    let db = format!("sqlite:{}/env/eds.sqlite", tmp.path().display());
    let uploads = tmp.path().join("env-uploads");
    let missing = tmp.path().join("nope.toml");

    let (_, stderr, success) = run_eds_with_env(
        &missing,
        &["init"],
        &[
            ("EASY_DATASET_DATABASE_URL", db.as_str()),
            ("EASY_DATASET_UPLOAD_DIR", uploads.to_str().unwrap()),
        ],
    );
    assert!(success, "init failed: {}", stderr);
    assert!(tmp.path().join("env/eds.sqlite").exists());
    assert!(uploads.is_dir());
}

#[test]
fn test_bad_numeric_override_is_rejected() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_eds_with_env(
        &config,
        &["init"],
        &[("EASY_DATASET_MAX_CONCURRENT_TASKS", "many")],
    );
    assert!(!success);
    assert!(stderr.contains("EASY_DATASET_MAX_CONCURRENT_TASKS"), "stderr: {}", stderr);
}

#[test]
fn test_db_backup_and_restore() {
    let (tmp, config) = setup_test_env();
    run_eds(&config, &["init"]);
    let kept = create_project(&config);
    let backup = tmp.path().join("backups/eds.sqlite");
    let backup_arg = backup.to_str().unwrap();

    let (stdout, stderr, success) = run_eds(&config, &["db", "backup", backup_arg]);
    assert!(success, "backup failed: {}", stderr);
    assert!(stdout.contains("backed up"));
    assert!(backup.exists());

    let (_, _, again) = run_eds(&config, &["db", "backup", backup_arg]);
    assert!(!again, "backup must not overwrite an existing file");

    let (later, _, _) = run_eds(&config, &["project", "create", "later"]);
    let later = later.trim().to_string();

    let (_, stderr, success) = run_eds(&config, &["db", "restore", backup_arg]);
    assert!(success, "restore failed: {}", stderr);
    let (stdout, _, _) = run_eds(&config, &["project", "list"]);
    assert!(stdout.contains(&kept));
    assert!(!stdout.contains(&later));
}
