use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_url(&config.app.database_url).await
}

/// Open a pool for `sqlite:<path>`, a bare path, or `sqlite::memory:`.
pub async fn connect_url(url: &str) -> Result<SqlitePool> {
    let path = database_path(url);

    if path.is_none() {
        // Every connection to :memory: is its own database, so keep one.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        return SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database");
    }
    let db_path = path.unwrap_or_default();

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    Ok(pool)
}

/// File path named by a database url, or `None` for an in-memory database.
pub fn database_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if rest == ":memory:" || rest.is_empty() {
        None
    } else {
        Some(PathBuf::from(rest))
    }
}

/// Write a consistent copy of the database behind `pool` to `dest`.
///
/// Uses `VACUUM INTO`, so writers on other connections are not blocked
/// and the copy is compacted. `dest` must not exist yet.
pub async fn backup(pool: &SqlitePool, dest: &Path) -> Result<()> {
    if tokio::fs::try_exists(dest).await? {
        bail!("Backup target already exists: {}", dest.display());
    }
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let target = dest
        .to_str()
        .with_context(|| format!("Backup path is not valid UTF-8: {}", dest.display()))?;
    sqlx::query("VACUUM INTO ?")
        .bind(target)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to back up database to {}", dest.display()))?;
    info!(path = %dest.display(), "database backed up");
    Ok(())
}

/// Replace the database at `url` with the backup at `source`.
///
/// The backup is checked for the `projects` table and copied to a staging
/// file first, so a bad source leaves the live database untouched. No pool
/// may be open on `url` while this runs.
pub async fn restore(url: &str, source: &Path) -> Result<()> {
    let target = database_path(url).context("Cannot restore into an in-memory database")?;
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", source.display()))?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open backup {}", source.display()))?;

    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'projects'",
    )
    .fetch_one(&pool)
    .await?;
    if tables == 0 {
        pool.close().await;
        bail!("{} is not an easy-dataset database", source.display());
    }

    let staging = target.with_extension("restore");
    if tokio::fs::try_exists(&staging).await? {
        tokio::fs::remove_file(&staging).await?;
    }
    if let Some(parent) = staging.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let copied = backup(&pool, &staging).await;
    pool.close().await;
    copied?;

    for suffix in ["-wal", "-shm"] {
        let side = PathBuf::from(format!("{}{}", target.display(), suffix));
        if tokio::fs::try_exists(&side).await? {
            tokio::fs::remove_file(&side).await?;
        }
    }
    tokio::fs::rename(&staging, &target)
        .await
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    info!(path = %target.display(), source = %source.display(), "database restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;

    async fn project_names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM projects ORDER BY name")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    async fn add_project(pool: &SqlitePool, id: &str, name: &str) {
        sqlx::query("INSERT INTO projects (id, name, created_at) VALUES (?, ?, 0)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("live.sqlite").display());
        let copy = dir.path().join("backups").join("snap.sqlite");

        let pool = connect_url(&url).await.unwrap();
        apply_schema(&pool).await.unwrap();
        add_project(&pool, "p1", "handbook").await;
        backup(&pool, &copy).await.unwrap();
        assert!(backup(&pool, &copy).await.is_err(), "existing target is kept");

        add_project(&pool, "p2", "scratch").await;
        assert_eq!(project_names(&pool).await, vec!["handbook", "scratch"]);
        pool.close().await;

        restore(&url, &copy).await.unwrap();
        let pool = connect_url(&url).await.unwrap();
        assert_eq!(project_names(&pool).await, vec!["handbook"]);
        pool.close().await;
    }

    #[tokio::test]
    async fn restore_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("live.sqlite").display());
        let pool = connect_url(&url).await.unwrap();
        apply_schema(&pool).await.unwrap();
        add_project(&pool, "p1", "handbook").await;
        pool.close().await;

        let other_url = format!("sqlite:{}", dir.path().join("other.sqlite").display());
        let other = connect_url(&other_url).await.unwrap();
        sqlx::query("CREATE TABLE notes (body TEXT)")
            .execute(&other)
            .await
            .unwrap();
        other.close().await;

        let err = restore(&url, &dir.path().join("other.sqlite")).await.unwrap_err();
        assert!(err.to_string().contains("not an easy-dataset database"));
        let pool = connect_url(&url).await.unwrap();
        assert_eq!(project_names(&pool).await, vec!["handbook"]);
        pool.close().await;
    }

    #[test]
    fn parses_database_urls() {
        assert_eq!(
            database_path("sqlite:./data/x.sqlite"),
            Some(PathBuf::from("./data/x.sqlite"))
        );
        assert_eq!(
            database_path("sqlite:///tmp/x.db"),
            Some(PathBuf::from("/tmp/x.db"))
        );
        assert_eq!(database_path("plain.db"), Some(PathBuf::from("plain.db")));
        assert_eq!(database_path("sqlite::memory:"), None);
    }
}
