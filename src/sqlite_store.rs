//! SQLite-backed [`Store`] implementation.
//!
//! Nested values (answers, provenance, selections, task payloads) are kept
//! as JSON text columns; timestamps are Unix milliseconds. Cascading
//! deletes are delegated to the schema's `ON DELETE CASCADE` clauses, so
//! the pool must be opened with foreign keys enabled (see [`crate::db`]).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use easy_dataset_core::models::{
    Answer, Chunk, Dataset, DatasetConversation, DatasetStatus, GaPair, Project, Question,
    QuestionStatus, Tag, Task, TaskPatch, TaskStatus, TaskType, Turn, UploadFile,
};
use easy_dataset_core::prompt::PromptTemplate;
use easy_dataset_core::store::{QuestionQuery, Store, TaskQuery};
use easy_dataset_core::{PipelineError, PipelineResult};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn storage_err(e: sqlx::Error) -> PipelineError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return PipelineError::Conflict(db.message().to_string());
        }
    }
    PipelineError::Storage(e.to_string())
}

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> PipelineResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> PipelineResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| PipelineError::Storage(format!("corrupt {} column: {}", column, e)))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> PipelineResult<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(storage_err)
}

fn project_from_row(row: &SqliteRow) -> PipelineResult<Project> {
    Ok(Project {
        id: get(row, "id")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        created_at: from_ms(get(row, "created_at")?),
    })
}

fn file_from_row(row: &SqliteRow) -> PipelineResult<UploadFile> {
    let metadata: String = get(row, "metadata_json")?;
    let size: i64 = get(row, "size")?;
    Ok(UploadFile {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        file_name: get(row, "file_name")?,
        extension: get(row, "extension")?,
        file_type: get(row, "file_type")?,
        stored_path: get(row, "stored_path")?,
        size: size.max(0) as u64,
        md5: get(row, "md5")?,
        metadata: from_json(&metadata, "metadata_json")?,
        created_at: from_ms(get(row, "created_at")?),
    })
}

fn chunk_from_row(row: &SqliteRow) -> PipelineResult<Chunk> {
    let tags: String = get(row, "tags_json")?;
    let ordinal: i64 = get(row, "ordinal")?;
    let start: i64 = get(row, "start_offset")?;
    let end: i64 = get(row, "end_offset")?;
    let overlap: i64 = get(row, "overlap")?;
    let tokens: i64 = get(row, "token_estimate")?;
    Ok(Chunk {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        file_id: get(row, "file_id")?,
        ordinal: ordinal as u32,
        name: get(row, "name")?,
        start_offset: start as usize,
        end_offset: end as usize,
        overlap: overlap as usize,
        content: get(row, "content")?,
        token_estimate: tokens as usize,
        summary: get(row, "summary")?,
        tags: from_json(&tags, "tags_json")?,
        hash: get(row, "hash")?,
    })
}

fn ga_pair_from_row(row: &SqliteRow) -> PipelineResult<GaPair> {
    let ordinal: i64 = get(row, "ordinal")?;
    let active: i64 = get(row, "active")?;
    Ok(GaPair {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        file_id: get(row, "file_id")?,
        chunk_id: get(row, "chunk_id")?,
        ordinal: ordinal as u32,
        genre_title: get(row, "genre_title")?,
        genre_desc: get(row, "genre_desc")?,
        audience_title: get(row, "audience_title")?,
        audience_desc: get(row, "audience_desc")?,
        active: active != 0,
    })
}

fn question_from_row(row: &SqliteRow) -> PipelineResult<Question> {
    let ordinal: i64 = get(row, "ordinal")?;
    let provenance: String = get(row, "provenance_json")?;
    let tags: String = get(row, "tags_json")?;
    let status: String = get(row, "status")?;
    let answer: Option<String> = get(row, "answer_json")?;
    let conversation: Option<String> = get(row, "conversation_json")?;
    Ok(Question {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        file_id: get(row, "file_id")?,
        chunk_id: get(row, "chunk_id")?,
        ordinal: ordinal as u32,
        text: get(row, "text")?,
        provenance: from_json(&provenance, "provenance_json")?,
        tags: from_json(&tags, "tags_json")?,
        ga_pair_id: get(row, "ga_pair_id")?,
        status: QuestionStatus::parse(&status)?,
        answer: answer
            .map(|a| from_json::<Answer>(&a, "answer_json"))
            .transpose()?,
        conversation: conversation
            .map(|c| from_json::<Vec<Turn>>(&c, "conversation_json"))
            .transpose()?,
    })
}

fn dataset_from_row(row: &SqliteRow) -> PipelineResult<Dataset> {
    let selection: String = get(row, "selection_json")?;
    let status: String = get(row, "status")?;
    let materialize: i64 = get(row, "materialize_ga_pairs")?;
    let snapshot_at: Option<i64> = get(row, "snapshot_at")?;
    let evaluation: Option<String> = get(row, "evaluation_json")?;
    Ok(Dataset {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        name: get(row, "name")?,
        selection: from_json(&selection, "selection_json")?,
        status: DatasetStatus::parse(&status)?,
        materialize_ga_pairs: materialize != 0,
        system_prompt: get(row, "system_prompt")?,
        snapshot_at: snapshot_at.map(from_ms),
        evaluation: evaluation
            .map(|e| from_json(&e, "evaluation_json"))
            .transpose()?,
        created_at: from_ms(get(row, "created_at")?),
    })
}

fn entry_from_row(row: &SqliteRow) -> PipelineResult<DatasetConversation> {
    let ordinal: i64 = get(row, "ordinal")?;
    let tags: String = get(row, "tags_json")?;
    let turns: String = get(row, "turns_json")?;
    Ok(DatasetConversation {
        id: get(row, "id")?,
        dataset_id: get(row, "dataset_id")?,
        ordinal: ordinal as u32,
        question_id: get(row, "question_id")?,
        chunk_id: get(row, "chunk_id")?,
        question: get(row, "question")?,
        answer: get(row, "answer")?,
        tags: from_json(&tags, "tags_json")?,
        ga_pair_id: get(row, "ga_pair_id")?,
        turns: from_json(&turns, "turns_json")?,
        score: get(row, "score")?,
    })
}

fn task_from_row(row: &SqliteRow) -> PipelineResult<Task> {
    let task_type: String = get(row, "task_type")?;
    let status: String = get(row, "status")?;
    let completed: i64 = get(row, "completed_units")?;
    let total: i64 = get(row, "total_units")?;
    let payload: String = get(row, "payload_json")?;
    let result: Option<String> = get(row, "result_json")?;
    let error: Option<String> = get(row, "error_json")?;
    let started_at: Option<i64> = get(row, "started_at")?;
    let finished_at: Option<i64> = get(row, "finished_at")?;
    let cancel_requested: i64 = get(row, "cancel_requested")?;
    Ok(Task {
        id: get(row, "id")?,
        project_id: get(row, "project_id")?,
        task_type: TaskType::parse(&task_type)?,
        target_id: get(row, "target_id")?,
        status: TaskStatus::parse(&status)?,
        progress: get(row, "progress")?,
        completed_units: completed.max(0) as u64,
        total_units: total.max(0) as u64,
        payload: from_json(&payload, "payload_json")?,
        result: result.map(|r| from_json(&r, "result_json")).transpose()?,
        error: error.map(|e| from_json(&e, "error_json")).transpose()?,
        cancel_requested: cancel_requested != 0,
        created_at: from_ms(get(row, "created_at")?),
        started_at: started_at.map(from_ms),
        finished_at: finished_at.map(from_ms),
    })
}

fn prompt_from_row(row: &SqliteRow) -> PipelineResult<PromptTemplate> {
    let version: i64 = get(row, "version")?;
    Ok(PromptTemplate {
        name: get(row, "name")?,
        version: version as u32,
        language: get(row, "language")?,
        system: get(row, "system")?,
        body: get(row, "body")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    // ═══════════════════════════════════════════════════════════════════
    // Projects
    // ═══════════════════════════════════════════════════════════════════

    async fn create_project(&self, project: &Project) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, description, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(to_ms(project.created_at))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> PipelineResult<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self) -> PipelineResult<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(project_from_row).collect()
    }

    async fn delete_project(&self, id: &str) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        // Questions cascade through chunks; these two only hang off the project id.
        sqlx::query("DELETE FROM questions WHERE project_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("project", id));
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Files
    // ═══════════════════════════════════════════════════════════════════

    async fn insert_file(&self, file: &UploadFile) -> PipelineResult<(UploadFile, bool)> {
        if self.get_project(&file.project_id).await?.is_none() {
            return Err(PipelineError::not_found("project", &file.project_id));
        }
        let result = sqlx::query(
            r#"
            INSERT INTO upload_files (id, project_id, file_name, extension, file_type,
                                      stored_path, size, md5, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, md5) DO NOTHING
            "#,
        )
        .bind(&file.id)
        .bind(&file.project_id)
        .bind(&file.file_name)
        .bind(&file.extension)
        .bind(&file.file_type)
        .bind(&file.stored_path)
        .bind(file.size as i64)
        .bind(&file.md5)
        .bind(to_json(&file.metadata)?)
        .bind(to_ms(file.created_at))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 1 {
            return Ok((file.clone(), true));
        }
        let existing = self
            .find_file_by_md5(&file.project_id, &file.md5)
            .await?
            .ok_or_else(|| PipelineError::Storage("file vanished during insert".into()))?;
        Ok((existing, false))
    }

    async fn get_file(&self, id: &str) -> PipelineResult<Option<UploadFile>> {
        let row = sqlx::query("SELECT * FROM upload_files WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn find_file_by_md5(
        &self,
        project_id: &str,
        md5: &str,
    ) -> PipelineResult<Option<UploadFile>> {
        let row = sqlx::query("SELECT * FROM upload_files WHERE project_id = ? AND md5 = ?")
            .bind(project_id)
            .bind(md5)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn list_files(&self, project_id: &str) -> PipelineResult<Vec<UploadFile>> {
        let rows = sqlx::query(
            "SELECT * FROM upload_files WHERE project_id = ? ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(file_from_row).collect()
    }

    async fn update_file_metadata(
        &self,
        id: &str,
        metadata: &serde_json::Value,
    ) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE upload_files SET metadata_json = ? WHERE id = ?")
            .bind(to_json(metadata)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("file", id));
        }
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> PipelineResult<()> {
        let result = sqlx::query("DELETE FROM upload_files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("file", id));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Chunks and tags
    // ═══════════════════════════════════════════════════════════════════

    async fn replace_chunks(&self, file_id: &str, chunks: &[Chunk]) -> PipelineResult<()> {
        if self.get_file(file_id).await?.is_none() {
            return Err(PipelineError::not_found("file", file_id));
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let existing: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT id, hash, start_offset, end_offset FROM chunks WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;
        for (id, hash, start, end) in existing {
            match chunks.iter().find(|c| c.id == id) {
                None => {
                    sqlx::query("DELETE FROM chunks WHERE id = ?")
                        .bind(&id)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
                Some(c)
                    if c.hash != hash
                        || c.start_offset as i64 != start
                        || c.end_offset as i64 != end =>
                {
                    // Rewritten text: questions asked about the old text go.
                    sqlx::query("DELETE FROM questions WHERE chunk_id = ?")
                        .bind(&id)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
                Some(_) => {}
            }
        }

        // Upsert instead of REPLACE so unchanged chunks keep their questions.
        for c in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, project_id, file_id, ordinal, name, start_offset,
                                    end_offset, overlap, content, token_estimate, summary,
                                    tags_json, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    ordinal = excluded.ordinal,
                    name = excluded.name,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    overlap = excluded.overlap,
                    content = excluded.content,
                    token_estimate = excluded.token_estimate,
                    summary = excluded.summary,
                    tags_json = excluded.tags_json,
                    hash = excluded.hash
                "#,
            )
            .bind(&c.id)
            .bind(&c.project_id)
            .bind(file_id)
            .bind(c.ordinal as i64)
            .bind(&c.name)
            .bind(c.start_offset as i64)
            .bind(c.end_offset as i64)
            .bind(c.overlap as i64)
            .bind(&c.content)
            .bind(c.token_estimate as i64)
            .bind(&c.summary)
            .bind(to_json(&c.tags)?)
            .bind(&c.hash)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> PipelineResult<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn list_chunks(&self, file_id: &str) -> PipelineResult<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE file_id = ? ORDER BY ordinal")
            .bind(file_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn set_chunk_tags(&self, chunk_id: &str, tags: &[String]) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE chunks SET tags_json = ? WHERE id = ?")
            .bind(to_json(&tags)?)
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("chunk", chunk_id));
        }
        Ok(())
    }

    async fn upsert_tag(&self, tag: &Tag) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tags (id, project_id, label, parent_id) VALUES (?, ?, ?, ?)
            ON CONFLICT(project_id, label) DO UPDATE SET
                id = excluded.id,
                parent_id = excluded.parent_id
            "#,
        )
        .bind(&tag.id)
        .bind(&tag.project_id)
        .bind(&tag.label)
        .bind(&tag.parent_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn list_tags(&self, project_id: &str) -> PipelineResult<Vec<Tag>> {
        let rows = sqlx::query("SELECT * FROM tags WHERE project_id = ? ORDER BY label")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter()
            .map(|row| {
                Ok(Tag {
                    id: get(row, "id")?,
                    project_id: get(row, "project_id")?,
                    label: get(row, "label")?,
                    parent_id: get(row, "parent_id")?,
                })
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // GA pairs
    // ═══════════════════════════════════════════════════════════════════

    async fn replace_ga_pairs(&self, file_id: &str, pairs: &[GaPair]) -> PipelineResult<()> {
        if self.get_file(file_id).await?.is_none() {
            return Err(PipelineError::not_found("file", file_id));
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query("DELETE FROM ga_pairs WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        for p in pairs {
            sqlx::query(
                r#"
                INSERT INTO ga_pairs (id, project_id, file_id, chunk_id, ordinal, genre_title,
                                      genre_desc, audience_title, audience_desc, active)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.id)
            .bind(&p.project_id)
            .bind(&p.file_id)
            .bind(&p.chunk_id)
            .bind(p.ordinal as i64)
            .bind(&p.genre_title)
            .bind(&p.genre_desc)
            .bind(&p.audience_title)
            .bind(&p.audience_desc)
            .bind(p.active as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn list_ga_pairs(
        &self,
        project_id: &str,
        file_id: Option<&str>,
    ) -> PipelineResult<Vec<GaPair>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ga_pairs
            WHERE project_id = ? AND (? IS NULL OR file_id = ?)
            ORDER BY file_id, ordinal
            "#,
        )
        .bind(project_id)
        .bind(file_id)
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(ga_pair_from_row).collect()
    }

    async fn set_ga_pair_active(&self, id: &str, active: bool) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE ga_pairs SET active = ? WHERE id = ?")
            .bind(active as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("ga_pair", id));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Questions
    // ═══════════════════════════════════════════════════════════════════

    async fn replace_chunk_questions(
        &self,
        chunk_id: &str,
        questions: &[Question],
    ) -> PipelineResult<()> {
        if self.get_chunk(chunk_id).await?.is_none() {
            return Err(PipelineError::not_found("chunk", chunk_id));
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query("DELETE FROM questions WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        for q in questions {
            sqlx::query(
                r#"
                INSERT INTO questions (id, project_id, file_id, chunk_id, ordinal, text,
                                       provenance_json, tags_json, ga_pair_id, status, answer_json,
                                       conversation_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&q.id)
            .bind(&q.project_id)
            .bind(&q.file_id)
            .bind(chunk_id)
            .bind(q.ordinal as i64)
            .bind(&q.text)
            .bind(to_json(&q.provenance)?)
            .bind(to_json(&q.tags)?)
            .bind(&q.ga_pair_id)
            .bind(q.status.as_str())
            .bind(q.answer.as_ref().map(to_json).transpose()?)
            .bind(q.conversation.as_ref().map(to_json).transpose()?)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn get_question(&self, id: &str) -> PipelineResult<Option<Question>> {
        let row = sqlx::query("SELECT * FROM questions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(question_from_row).transpose()
    }

    async fn list_questions(&self, query: &QuestionQuery) -> PipelineResult<Vec<Question>> {
        let rows = sqlx::query(
            r#"
            SELECT q.* FROM questions q
            LEFT JOIN chunks c ON c.id = q.chunk_id
            WHERE (?1 IS NULL OR q.project_id = ?1)
              AND (?2 IS NULL OR q.file_id = ?2)
              AND (?3 IS NULL OR q.chunk_id = ?3)
              AND (?4 IS NULL OR q.status = ?4)
            ORDER BY q.file_id, c.ordinal, q.ordinal
            "#,
        )
        .bind(&query.project_id)
        .bind(&query.file_id)
        .bind(&query.chunk_id)
        .bind(query.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(question_from_row).collect()
    }

    async fn update_question(&self, question: &Question) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE questions
            SET text = ?, tags_json = ?, status = ?, answer_json = ?, conversation_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&question.text)
        .bind(to_json(&question.tags)?)
        .bind(question.status.as_str())
        .bind(question.answer.as_ref().map(to_json).transpose()?)
        .bind(question.conversation.as_ref().map(to_json).transpose()?)
        .bind(&question.id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("question", &question.id));
        }
        Ok(())
    }

    async fn set_answer(&self, question_id: &str, answer: &Answer) -> PipelineResult<()> {
        let result = sqlx::query("UPDATE questions SET answer_json = ?, status = ? WHERE id = ?")
            .bind(to_json(answer)?)
            .bind(QuestionStatus::Answered.as_str())
            .bind(question_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("question", question_id));
        }
        Ok(())
    }

    async fn delete_question(&self, id: &str) -> PipelineResult<()> {
        let result = sqlx::query("DELETE FROM questions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("question", id));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Datasets
    // ═══════════════════════════════════════════════════════════════════

    async fn create_dataset(&self, dataset: &Dataset) -> PipelineResult<()> {
        if self.get_project(&dataset.project_id).await?.is_none() {
            return Err(PipelineError::not_found("project", &dataset.project_id));
        }
        sqlx::query(
            r#"
            INSERT INTO datasets (id, project_id, name, selection_json, status,
                                  materialize_ga_pairs, system_prompt, snapshot_at,
                                  evaluation_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&dataset.id)
        .bind(&dataset.project_id)
        .bind(&dataset.name)
        .bind(to_json(&dataset.selection)?)
        .bind(dataset.status.as_str())
        .bind(dataset.materialize_ga_pairs as i64)
        .bind(&dataset.system_prompt)
        .bind(dataset.snapshot_at.map(to_ms))
        .bind(dataset.evaluation.as_ref().map(to_json).transpose()?)
        .bind(to_ms(dataset.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match storage_err(e) {
            PipelineError::Conflict(_) => {
                PipelineError::Conflict(format!("dataset '{}' already exists", dataset.name))
            }
            other => other,
        })?;
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> PipelineResult<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn list_datasets(&self, project_id: &str) -> PipelineResult<Vec<Dataset>> {
        let rows =
            sqlx::query("SELECT * FROM datasets WHERE project_id = ? ORDER BY created_at, id")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
        rows.iter().map(dataset_from_row).collect()
    }

    async fn update_dataset(&self, dataset: &Dataset) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE datasets SET name = ?, selection_json = ?, status = ?,
                materialize_ga_pairs = ?, system_prompt = ?, snapshot_at = ?,
                evaluation_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&dataset.name)
        .bind(to_json(&dataset.selection)?)
        .bind(dataset.status.as_str())
        .bind(dataset.materialize_ga_pairs as i64)
        .bind(&dataset.system_prompt)
        .bind(dataset.snapshot_at.map(to_ms))
        .bind(dataset.evaluation.as_ref().map(to_json).transpose()?)
        .bind(&dataset.id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("dataset", &dataset.id));
        }
        Ok(())
    }

    async fn save_dataset_snapshot(
        &self,
        dataset: &Dataset,
        entries: &[DatasetConversation],
    ) -> PipelineResult<()> {
        let dataset_id = dataset.id.as_str();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let result = sqlx::query(
            r#"
            UPDATE datasets SET name = ?, selection_json = ?, status = ?,
                materialize_ga_pairs = ?, system_prompt = ?, snapshot_at = ?,
                evaluation_json = ?
            WHERE id = ?
            "#,
        )
        .bind(&dataset.name)
        .bind(to_json(&dataset.selection)?)
        .bind(dataset.status.as_str())
        .bind(dataset.materialize_ga_pairs as i64)
        .bind(&dataset.system_prompt)
        .bind(dataset.snapshot_at.map(to_ms))
        .bind(dataset.evaluation.as_ref().map(to_json).transpose()?)
        .bind(dataset_id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("dataset", dataset_id));
        }
        sqlx::query("DELETE FROM dataset_entries WHERE dataset_id = ?")
            .bind(dataset_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        for e in entries {
            sqlx::query(
                r#"
                INSERT INTO dataset_entries (id, dataset_id, ordinal, question_id, chunk_id,
                                             question, answer, tags_json, ga_pair_id,
                                             turns_json, score)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&e.id)
            .bind(dataset_id)
            .bind(e.ordinal as i64)
            .bind(&e.question_id)
            .bind(&e.chunk_id)
            .bind(&e.question)
            .bind(&e.answer)
            .bind(to_json(&e.tags)?)
            .bind(&e.ga_pair_id)
            .bind(to_json(&e.turns)?)
            .bind(e.score)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn list_dataset_entries(
        &self,
        dataset_id: &str,
    ) -> PipelineResult<Vec<DatasetConversation>> {
        let rows =
            sqlx::query("SELECT * FROM dataset_entries WHERE dataset_id = ? ORDER BY ordinal")
                .bind(dataset_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
        rows.iter().map(entry_from_row).collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Tasks
    // ═══════════════════════════════════════════════════════════════════

    async fn insert_task(&self, task: &Task) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, project_id, task_type, target_id, status, progress,
                               completed_units, total_units, payload_json, result_json,
                               error_json, created_at, started_at, finished_at, seq)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM tasks))
            "#,
        )
        .bind(&task.id)
        .bind(&task.project_id)
        .bind(task.task_type.as_str())
        .bind(&task.target_id)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.completed_units as i64)
        .bind(task.total_units as i64)
        .bind(to_json(&task.payload)?)
        .bind(task.result.as_ref().map(to_json).transpose()?)
        .bind(task.error.as_ref().map(to_json).transpose()?)
        .bind(to_ms(task.created_at))
        .bind(task.started_at.map(to_ms))
        .bind(task.finished_at.map(to_ms))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> PipelineResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, query: &TaskQuery) -> PipelineResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR task_type = ?3)
            ORDER BY seq
            "#,
        )
        .bind(&query.project_id)
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.task_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn transition_task(
        &self,
        id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> PipelineResult<Task> {
        let mut task = self
            .get_task(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        if !from.contains(&task.status) {
            return Err(PipelineError::Conflict(format!(
                "task {} is {}, cannot move to {}",
                id,
                task.status.as_str(),
                to.as_str()
            )));
        }
        let observed = task.status;
        task.status = to;
        task.apply_patch(patch);
        if to == TaskStatus::Queued {
            task.cancel_requested = false;
        }
        if to.is_terminal() {
            task.finished_at = Some(Utc::now());
        }

        // The status guard makes the write a compare-and-set.
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = ?, progress = ?, completed_units = ?, total_units = ?,
                payload_json = ?, result_json = ?, error_json = ?, finished_at = ?,
                cancel_requested = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(task.completed_units as i64)
        .bind(task.total_units as i64)
        .bind(to_json(&task.payload)?)
        .bind(task.result.as_ref().map(to_json).transpose()?)
        .bind(task.error.as_ref().map(to_json).transpose()?)
        .bind(task.finished_at.map(to_ms))
        .bind(task.cancel_requested)
        .bind(id)
        .bind(observed.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::Conflict(format!(
                "task {} changed state concurrently",
                id
            )));
        }
        Ok(task)
    }

    async fn start_task(&self, id: &str) -> PipelineResult<Task> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'running', started_at = ?
            WHERE id = ? AND status = 'queued'
              AND NOT EXISTS (
                  SELECT 1 FROM tasks other
                  WHERE other.id != tasks.id
                    AND other.status = 'running'
                    AND other.project_id = tasks.project_id
                    AND other.task_type = tasks.task_type
                    AND other.target_id IS tasks.target_id
              )
            "#,
        )
        .bind(to_ms(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        let task = self
            .get_task(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        if result.rows_affected() == 0 {
            if task.status != TaskStatus::Queued {
                return Err(PipelineError::Conflict(format!(
                    "task {} is {}, not queued",
                    id,
                    task.status.as_str()
                )));
            }
            return Err(PipelineError::Conflict(format!(
                "another {} task is already running for this target",
                task.task_type.as_str()
            )));
        }
        Ok(task)
    }

    async fn update_task_progress(&self, id: &str, patch: TaskPatch) -> PipelineResult<()> {
        let mut task = self
            .get_task(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        task.apply_patch(patch);
        sqlx::query(
            r#"
            UPDATE tasks SET progress = ?, completed_units = ?, total_units = ?,
                payload_json = ?, result_json = ?, error_json = ?
            WHERE id = ?
            "#,
        )
        .bind(task.progress)
        .bind(task.completed_units as i64)
        .bind(task.total_units as i64)
        .bind(to_json(&task.payload)?)
        .bind(task.result.as_ref().map(to_json).transpose()?)
        .bind(task.error.as_ref().map(to_json).transpose()?)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> PipelineResult<Task> {
        let before = self
            .get_task(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", id))?;
        if before.status.is_terminal() {
            return Err(PipelineError::Conflict(format!(
                "task {} is already {}",
                id,
                before.status.as_str()
            )));
        }

        let error = to_json(&PipelineError::Cancelled.view().with_task(id))?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        sqlx::query(
            r#"
            UPDATE tasks SET status = 'cancelled', cancel_requested = 1,
                error_json = ?, finished_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(&error)
        .bind(to_ms(Utc::now()))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        // A task that started in between keeps running until its next checkpoint.
        sqlx::query("UPDATE tasks SET cancel_requested = 1 WHERE id = ? AND status = 'running'")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        self.get_task(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", id))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Prompts
    // ═══════════════════════════════════════════════════════════════════

    async fn save_prompt(&self, prompt: &PromptTemplate) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO prompts (name, version, language, system, body) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name, version, language) DO UPDATE SET
                system = excluded.system,
                body = excluded.body
            "#,
        )
        .bind(&prompt.name)
        .bind(prompt.version as i64)
        .bind(&prompt.language)
        .bind(&prompt.system)
        .bind(&prompt.body)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_prompt(
        &self,
        name: &str,
        version: u32,
        language: &str,
    ) -> PipelineResult<Option<PromptTemplate>> {
        let row =
            sqlx::query("SELECT * FROM prompts WHERE name = ? AND version = ? AND language = ?")
                .bind(name)
                .bind(version as i64)
                .bind(language)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        row.as_ref().map(prompt_from_row).transpose()
    }

    async fn list_prompts(&self) -> PipelineResult<Vec<PromptTemplate>> {
        let rows = sqlx::query("SELECT * FROM prompts ORDER BY name, version, language")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(prompt_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use easy_dataset_core::models::{Provenance, Selection};
    use serde_json::json;

    async fn store() -> SqliteStore {
        let pool = db::connect_url("sqlite::memory:").await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn project(id: &str) -> Project {
        Project {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn file(id: &str, project: &str, md5: &str) -> UploadFile {
        UploadFile {
            id: id.into(),
            project_id: project.into(),
            file_name: format!("{}.txt", id),
            extension: "txt".into(),
            file_type: "txt".into(),
            stored_path: format!("/tmp/{}.txt", md5),
            size: 10,
            md5: md5.into(),
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    fn chunk(id: &str, file: &str, ordinal: u32) -> Chunk {
        Chunk {
            id: id.into(),
            project_id: "p".into(),
            file_id: file.into(),
            ordinal,
            name: format!("f-part-{}", ordinal + 1),
            start_offset: 0,
            end_offset: 5,
            overlap: 0,
            content: "hello".into(),
            token_estimate: 2,
            summary: None,
            tags: vec![],
            hash: "h".into(),
        }
    }

    fn question(id: &str, chunk: &str, ordinal: u32) -> Question {
        Question {
            id: id.into(),
            project_id: "p".into(),
            file_id: "f".into(),
            chunk_id: chunk.into(),
            ordinal,
            text: format!("question {}?", id),
            provenance: Provenance {
                model: "m".into(),
                prompt: "question".into(),
                prompt_version: 1,
                generated_at: Utc::now(),
            },
            tags: vec!["t".into()],
            ga_pair_id: None,
            status: QuestionStatus::Pending,
            answer: None,
            conversation: None,
        }
    }

    fn task(id: &str, target: &str) -> Task {
        Task {
            id: id.into(),
            project_id: "p".into(),
            task_type: TaskType::QuestionGeneration,
            target_id: Some(target.into()),
            status: TaskStatus::Queued,
            progress: 0.0,
            completed_units: 0,
            total_units: 0,
            payload: json!({}),
            result: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_md5_returns_existing_file() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        let (_, created) = s.insert_file(&file("f1", "p", "abc")).await.unwrap();
        assert!(created);
        let (existing, created) = s.insert_file(&file("f2", "p", "abc")).await.unwrap();
        assert!(!created);
        assert_eq!(existing.id, "f1");
        assert_eq!(s.list_files("p").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rechunking_drops_questions_of_removed_chunks_only() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        s.insert_file(&file("f", "p", "abc")).await.unwrap();
        s.replace_chunks("f", &[chunk("c0", "f", 0), chunk("c1", "f", 1)])
            .await
            .unwrap();
        s.replace_chunk_questions("c0", &[question("q0", "c0", 0)])
            .await
            .unwrap();
        s.replace_chunk_questions("c1", &[question("q1", "c1", 0)])
            .await
            .unwrap();

        s.replace_chunks("f", &[chunk("c0", "f", 0)]).await.unwrap();
        let qs = s.list_questions(&QuestionQuery::project("p")).await.unwrap();
        assert_eq!(qs.len(), 1);
        assert_eq!(qs[0].id, "q0");
        assert_eq!(qs[0].tags, vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn rechunking_drops_questions_of_rewritten_chunks() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        s.insert_file(&file("f", "p", "abc")).await.unwrap();
        s.replace_chunks("f", &[chunk("c0", "f", 0), chunk("c1", "f", 1)])
            .await
            .unwrap();
        s.replace_chunk_questions("c0", &[question("q0", "c0", 0)])
            .await
            .unwrap();
        s.replace_chunk_questions("c1", &[question("q1", "c1", 0)])
            .await
            .unwrap();

        let mut rewritten = chunk("c1", "f", 1);
        rewritten.content = "a longer replacement body".into();
        rewritten.hash = "new-hash".into();
        rewritten.end_offset = 35;
        s.replace_chunks("f", &[chunk("c0", "f", 0), rewritten])
            .await
            .unwrap();

        let qs = s.list_questions(&QuestionQuery::project("p")).await.unwrap();
        let ids: Vec<&str> = qs.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q0"]);
        let kept = s.get_chunk("c1").await.unwrap().unwrap();
        assert_eq!(kept.hash, "new-hash");
    }

    fn entry(id: &str, dataset: &str, ordinal: u32) -> DatasetConversation {
        DatasetConversation {
            id: id.into(),
            dataset_id: dataset.into(),
            ordinal,
            question_id: format!("q{}", ordinal),
            chunk_id: "c0".into(),
            question: "Q?".into(),
            answer: "A.".into(),
            tags: vec![],
            ga_pair_id: None,
            turns: vec![],
            score: None,
        }
    }

    #[tokio::test]
    async fn failed_snapshot_leaves_dataset_untouched() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        let mut dataset = Dataset {
            id: "d".into(),
            project_id: "p".into(),
            name: "v1".into(),
            selection: Selection::Ids { question_ids: vec![] },
            status: DatasetStatus::Draft,
            materialize_ga_pairs: false,
            system_prompt: None,
            snapshot_at: None,
            evaluation: None,
            created_at: Utc::now(),
        };
        s.create_dataset(&dataset).await.unwrap();

        dataset.status = DatasetStatus::Snapshotted;
        dataset.snapshot_at = Some(Utc::now());
        // Two entries at the same ordinal violate UNIQUE(dataset_id, ordinal).
        let bad = [entry("e0", "d", 0), entry("e1", "d", 0)];
        assert!(s.save_dataset_snapshot(&dataset, &bad).await.is_err());
        let stored = s.get_dataset("d").await.unwrap().unwrap();
        assert_eq!(stored.status, DatasetStatus::Draft);
        assert!(stored.snapshot_at.is_none());
        assert!(s.list_dataset_entries("d").await.unwrap().is_empty());

        let good = [entry("e0", "d", 0), entry("e1", "d", 1)];
        s.save_dataset_snapshot(&dataset, &good).await.unwrap();
        let stored = s.get_dataset("d").await.unwrap().unwrap();
        assert_eq!(stored.status, DatasetStatus::Snapshotted);
        assert_eq!(s.list_dataset_entries("d").await.unwrap().len(), 2);

        dataset.id = "missing".into();
        let err = s.save_dataset_snapshot(&dataset, &good).await.unwrap_err();
        assert_eq!(err.kind(), easy_dataset_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn deleting_project_cascades() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        s.insert_file(&file("f", "p", "abc")).await.unwrap();
        s.replace_chunks("f", &[chunk("c0", "f", 0)]).await.unwrap();
        s.replace_chunk_questions("c0", &[question("q0", "c0", 0)])
            .await
            .unwrap();
        s.delete_project("p").await.unwrap();
        assert!(s.get_file("f").await.unwrap().is_none());
        assert!(s.get_chunk("c0").await.unwrap().is_none());
        assert!(s.get_question("q0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_task_enforces_single_runner() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        s.insert_task(&task("t1", "f")).await.unwrap();
        s.insert_task(&task("t2", "f")).await.unwrap();
        s.insert_task(&task("t3", "other")).await.unwrap();

        let running = s.start_task("t1").await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        let err = s.start_task("t2").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
        s.start_task("t3").await.unwrap();

        let listed = s.list_tasks(&TaskQuery::default()).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        s.insert_task(&task("t1", "f")).await.unwrap();
        s.start_task("t1").await.unwrap();

        let done = s
            .transition_task(
                "t1",
                &[TaskStatus::Running],
                TaskStatus::Succeeded,
                TaskPatch {
                    progress: Some(1.0),
                    result: Some(json!({"questions": 3})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(done.finished_at.is_some());
        assert_eq!(done.result, Some(json!({"questions": 3})));

        let err = s
            .transition_task("t1", &[TaskStatus::Running], TaskStatus::Failed, TaskPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_request_depends_on_status() {
        let s = store().await;
        s.create_project(&project("p")).await.unwrap();
        s.insert_task(&task("queued", "a")).await.unwrap();
        s.insert_task(&task("running", "b")).await.unwrap();
        s.start_task("running").await.unwrap();

        let t = s.request_cancel("queued").await.unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.finished_at.is_some());

        let t = s.request_cancel("running").await.unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert!(t.cancel_requested);

        let err = s.request_cancel("queued").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }
}
