use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS upload_files (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        file_name TEXT NOT NULL,
        extension TEXT NOT NULL,
        file_type TEXT NOT NULL,
        stored_path TEXT NOT NULL,
        size INTEGER NOT NULL,
        md5 TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        UNIQUE(project_id, md5),
        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        name TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        overlap INTEGER NOT NULL DEFAULT 0,
        content TEXT NOT NULL,
        token_estimate INTEGER NOT NULL,
        summary TEXT,
        tags_json TEXT NOT NULL DEFAULT '[]',
        hash TEXT NOT NULL,
        UNIQUE(file_id, ordinal),
        FOREIGN KEY (file_id) REFERENCES upload_files(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        label TEXT NOT NULL,
        parent_id TEXT,
        UNIQUE(project_id, label),
        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ga_pairs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        file_id TEXT,
        chunk_id TEXT,
        ordinal INTEGER NOT NULL,
        genre_title TEXT NOT NULL,
        genre_desc TEXT NOT NULL,
        audience_title TEXT NOT NULL,
        audience_desc TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
        FOREIGN KEY (file_id) REFERENCES upload_files(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS questions (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        text TEXT NOT NULL,
        provenance_json TEXT NOT NULL,
        tags_json TEXT NOT NULL DEFAULT '[]',
        ga_pair_id TEXT,
        status TEXT NOT NULL,
        answer_json TEXT,
        conversation_json TEXT,
        UNIQUE(chunk_id, ordinal),
        FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        selection_json TEXT NOT NULL,
        status TEXT NOT NULL,
        materialize_ga_pairs INTEGER NOT NULL DEFAULT 0,
        system_prompt TEXT,
        snapshot_at INTEGER,
        evaluation_json TEXT,
        created_at INTEGER NOT NULL,
        UNIQUE(project_id, name),
        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dataset_entries (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        question_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        tags_json TEXT NOT NULL DEFAULT '[]',
        ga_pair_id TEXT,
        turns_json TEXT NOT NULL,
        score REAL,
        UNIQUE(dataset_id, ordinal),
        FOREIGN KEY (dataset_id) REFERENCES datasets(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        task_type TEXT NOT NULL,
        target_id TEXT,
        status TEXT NOT NULL,
        progress REAL NOT NULL DEFAULT 0,
        completed_units INTEGER NOT NULL DEFAULT 0,
        total_units INTEGER NOT NULL DEFAULT 0,
        payload_json TEXT NOT NULL DEFAULT '{}',
        result_json TEXT,
        error_json TEXT,
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER,
        seq INTEGER NOT NULL,
        FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prompts (
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        language TEXT NOT NULL,
        system TEXT,
        body TEXT NOT NULL,
        PRIMARY KEY (name, version, language)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_questions_project ON questions(project_id, file_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, seq)",
];
