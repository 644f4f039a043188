//! Configuration loading against the real process environment.

use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use easy_dataset::config::{load_config, load_or_default};

const VARS: [&str; 4] = [
    "EASY_DATASET_DATABASE_URL",
    "EASY_DATASET_MAX_CONCURRENT_TASKS",
    "EASY_DATASET_TASK_TIMEOUT",
    "EASY_DATASET_LOG_LEVEL",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn environment_overrides_file_values() {
    clear_env();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("easy-dataset.toml");
    fs::write(
        &path,
        "[app]\ndatabase_url = \"sqlite:./from-file.sqlite\"\n\n[tasks]\nmax_concurrent_tasks = 2\ntask_timeout = 60\n",
    )
    .unwrap();

    std::env::set_var("EASY_DATASET_MAX_CONCURRENT_TASKS", "7");
    std::env::set_var("EASY_DATASET_LOG_LEVEL", "debug");
    let cfg = load_config(&path).unwrap();
    clear_env();

    assert_eq!(cfg.app.database_url, "sqlite:./from-file.sqlite");
    assert_eq!(cfg.tasks.max_concurrent_tasks, 7);
    assert_eq!(cfg.tasks.task_timeout, 60);
    assert_eq!(cfg.app.log_level, "debug");
}

#[test]
#[serial]
fn missing_file_falls_back_to_defaults() {
    clear_env();
    let tmp = TempDir::new().unwrap();
    std::env::set_var("EASY_DATASET_TASK_TIMEOUT", "90");
    let cfg = load_or_default(&tmp.path().join("absent.toml")).unwrap();
    clear_env();

    assert_eq!(cfg.tasks.task_timeout, 90);
    assert_eq!(cfg.tasks.max_concurrent_tasks, 5);
    assert_eq!(cfg.app.database_url, "sqlite:./data/easy-dataset.sqlite");
}

#[test]
#[serial]
fn unparseable_override_is_an_error() {
    clear_env();
    let tmp = TempDir::new().unwrap();
    std::env::set_var("EASY_DATASET_TASK_TIMEOUT", "soon");
    let err = load_or_default(&tmp.path().join("absent.toml")).unwrap_err();
    clear_env();

    assert!(err.to_string().contains("EASY_DATASET_TASK_TIMEOUT"));
}

#[test]
#[serial]
fn invalid_values_fail_validation() {
    clear_env();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("easy-dataset.toml");
    fs::write(&path, "[chunking]\nmin_size = 4000\nmax_size = 3000\n").unwrap();
    assert!(load_config(&path).is_err());

    fs::write(&path, "[tasks]\nmax_concurrent_tasks = 0\n").unwrap();
    assert!(load_config(&path).is_err());
}
