//! Record store: projects, file versions, chunk sets, commits, analyses.
//!
//! Plain `sqlx` queries over a shared [`SqlitePool`]. File versions and chunk
//! sets are never updated in place: a new version flips the previous current
//! row off, and chunks are invalidated rather than deleted (only the
//! retention sweep deletes them).

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::now_ts;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{normalize_repo_url, Project, RepoFile, RepoFileChunk, RepoRef, TextChunk};
use crate::traits::CommitInfo;

// ============ Projects ============

fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        owner: row.get("owner"),
        name: row.get("name"),
        url: row.get("url"),
        default_branch: row.get("default_branch"),
        created_at: row.get("created_at"),
    }
}

/// Insert a project, or return the existing one with the same owner/name.
pub async fn insert_project(
    pool: &SqlitePool,
    owner: &str,
    name: &str,
    url: &str,
    default_branch: &str,
) -> Result<Project> {
    sqlx::query(
        r#"
        INSERT INTO projects (id, owner, name, url, url_key, default_branch, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(owner, name) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(owner)
    .bind(name)
    .bind(url)
    .bind(normalize_repo_url(url))
    .bind(default_branch)
    .bind(now_ts())
    .execute(pool)
    .await?;

    find_project(pool, &RepoRef::new(owner, name))
        .await?
        .with_context(|| format!("project {}/{} missing after insert", owner, name))
}

/// Look up by `owner/name`, ignoring case as the host does.
pub async fn find_project(pool: &SqlitePool, repo: &RepoRef) -> Result<Option<Project>> {
    let row = sqlx::query(
        "SELECT * FROM projects WHERE owner = ? COLLATE NOCASE AND name = ? COLLATE NOCASE",
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(project_from_row))
}

/// Look up by repository URL in any of its common spellings.
pub async fn find_project_by_url(pool: &SqlitePool, url: &str) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE url_key = ?")
        .bind(normalize_repo_url(url))
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(project_from_row))
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY owner, name")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(project_from_row).collect())
}

// ============ File versions ============

fn file_from_row(row: &SqliteRow) -> RepoFile {
    RepoFile {
        id: row.get("id"),
        project_id: row.get("project_id"),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        size_bytes: row.get("size_bytes"),
        blob_key: row.get("blob_key"),
        is_current: row.get::<i64, _>("is_current") != 0,
        created_at: row.get("created_at"),
    }
}

/// Current version of every tracked path, keyed by path.
pub async fn current_files(pool: &SqlitePool, project_id: &str) -> Result<HashMap<String, RepoFile>> {
    let rows = sqlx::query("SELECT * FROM repo_files WHERE project_id = ? AND is_current = 1")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(file_from_row)
        .map(|f| (f.path.clone(), f))
        .collect())
}

pub async fn current_file(pool: &SqlitePool, project_id: &str, path: &str) -> Result<Option<RepoFile>> {
    let row = sqlx::query(
        "SELECT * FROM repo_files WHERE project_id = ? AND path = ? AND is_current = 1",
    )
    .bind(project_id)
    .bind(path)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(file_from_row))
}

/// Every version of `path`, newest first.
pub async fn file_history(pool: &SqlitePool, project_id: &str, path: &str) -> Result<Vec<RepoFile>> {
    let rows = sqlx::query(
        "SELECT * FROM repo_files WHERE project_id = ? AND path = ? ORDER BY created_at DESC, rowid DESC",
    )
    .bind(project_id)
    .bind(path)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(file_from_row).collect())
}

/// Record a new current version of `path`.
///
/// In one transaction: the previous current row is flipped off, the path's
/// current chunks are invalidated, and the new row is inserted.
pub async fn insert_file_version(
    pool: &SqlitePool,
    project_id: &str,
    path: &str,
    content_hash: &str,
    size_bytes: i64,
    blob_key: &str,
) -> Result<RepoFile> {
    let now = now_ts();
    let file = RepoFile {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        path: path.to_string(),
        content_hash: content_hash.to_string(),
        size_bytes,
        blob_key: blob_key.to_string(),
        is_current: true,
        created_at: now,
    };

    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE repo_files SET is_current = 0, superseded_at = ? WHERE project_id = ? AND path = ? AND is_current = 1",
    )
    .bind(now)
    .bind(project_id)
    .bind(path)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE repo_file_chunks SET is_current = 0, invalidated_at = ? WHERE project_id = ? AND path = ? AND is_current = 1",
    )
    .bind(now)
    .bind(project_id)
    .bind(path)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO repo_files (id, project_id, path, content_hash, size_bytes, blob_key, is_current, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(&file.id)
    .bind(&file.project_id)
    .bind(&file.path)
    .bind(&file.content_hash)
    .bind(file.size_bytes)
    .bind(&file.blob_key)
    .bind(file.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(file)
}

/// Flip the current row of `path` off and invalidate its chunks.
///
/// Returns the retired row, or `None` when the path had no current version.
pub async fn retire_file(pool: &SqlitePool, project_id: &str, path: &str) -> Result<Option<RepoFile>> {
    let Some(current) = current_file(pool, project_id, path).await? else {
        return Ok(None);
    };
    let now = now_ts();
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE repo_files SET is_current = 0, superseded_at = ? WHERE id = ? AND is_current = 1")
        .bind(now)
        .bind(&current.id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "UPDATE repo_file_chunks SET is_current = 0, invalidated_at = ? WHERE project_id = ? AND path = ? AND is_current = 1",
    )
    .bind(now)
    .bind(project_id)
    .bind(path)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(RepoFile {
        is_current: false,
        ..current
    }))
}

/// Whether any current file version still points at `blob_key`.
pub async fn blob_in_use(pool: &SqlitePool, blob_key: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM repo_files WHERE blob_key = ? AND is_current = 1")
            .bind(blob_key)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Current non-empty files that have no current chunks.
pub async fn files_missing_chunks(pool: &SqlitePool, project_id: &str) -> Result<Vec<RepoFile>> {
    let rows = sqlx::query(
        r#"
        SELECT f.* FROM repo_files f
        WHERE f.project_id = ? AND f.is_current = 1 AND f.size_bytes > 0
          AND NOT EXISTS (
            SELECT 1 FROM repo_file_chunks c WHERE c.file_id = f.id AND c.is_current = 1
          )
        ORDER BY f.path
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(file_from_row).collect())
}

// ============ Chunks ============

/// Store the chunk set of `file`, atomically.
///
/// `vectors` must be `None` or hold one vector per chunk. Any chunks still
/// current for this file version are invalidated first.
pub async fn insert_chunks(
    pool: &SqlitePool,
    file: &RepoFile,
    chunks: &[TextChunk],
    vectors: Option<&[Vec<f32>]>,
    model: Option<&str>,
) -> Result<usize> {
    if let Some(v) = vectors {
        anyhow::ensure!(
            v.len() == chunks.len(),
            "{} vectors for {} chunks",
            v.len(),
            chunks.len()
        );
    }
    let now = now_ts();
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE repo_file_chunks SET is_current = 0, invalidated_at = ? WHERE file_id = ? AND is_current = 1")
        .bind(now)
        .bind(&file.id)
        .execute(&mut *tx)
        .await?;

    for (i, chunk) in chunks.iter().enumerate() {
        let blob = vectors.map(|v| vec_to_blob(&v[i]));
        sqlx::query(
            r#"
            INSERT INTO repo_file_chunks
                (id, file_id, project_id, path, chunk_index, text, text_hash, embedding, embedding_model, is_current, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&file.id)
        .bind(&file.project_id)
        .bind(&file.path)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(blob)
        .bind(vectors.and(model))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(chunks.len())
}

fn chunk_from_row(row: &SqliteRow) -> RepoFileChunk {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    RepoFileChunk {
        id: row.get("id"),
        file_id: row.get("file_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        embedding: embedding.map(|b| blob_to_vec(&b)),
        embedding_model: row.get("embedding_model"),
        is_current: row.get::<i64, _>("is_current") != 0,
    }
}

/// Current chunks of one file version, by index.
pub async fn current_chunks(pool: &SqlitePool, file_id: &str) -> Result<Vec<RepoFileChunk>> {
    let rows = sqlx::query(
        "SELECT * FROM repo_file_chunks WHERE file_id = ? AND is_current = 1 ORDER BY chunk_index",
    )
    .bind(file_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

/// Every chunk ever stored for one file version, current or not.
pub async fn all_chunks(pool: &SqlitePool, file_id: &str) -> Result<Vec<RepoFileChunk>> {
    let rows = sqlx::query("SELECT * FROM repo_file_chunks WHERE file_id = ? ORDER BY created_at, chunk_index")
        .bind(file_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

/// Delete invalidated chunks whose `invalidated_at` is before `cutoff`.
pub async fn delete_invalidated_chunks(pool: &SqlitePool, cutoff: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM repo_file_chunks WHERE is_current = 0 AND invalidated_at IS NOT NULL AND invalidated_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ============ Commits ============

/// Record a commit. Returns `false` when it was already known.
pub async fn upsert_commit(pool: &SqlitePool, project_id: &str, commit: &CommitInfo) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO commits (project_id, sha, message, author, committed_at, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, sha) DO NOTHING
        "#,
    )
    .bind(project_id)
    .bind(&commit.sha)
    .bind(&commit.message)
    .bind(&commit.author)
    .bind(&commit.committed_at)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_commits(pool: &SqlitePool, project_id: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM commits WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

// ============ Analyses ============

/// When the analysis for `project_id` was last generated.
pub async fn last_analysis_at(pool: &SqlitePool, project_id: &str) -> Result<Option<i64>> {
    let ts: Option<i64> = sqlx::query_scalar("SELECT generated_at FROM analyses WHERE project_id = ?")
        .bind(project_id)
        .fetch_optional(pool)
        .await?;
    Ok(ts)
}

pub async fn record_analysis(pool: &SqlitePool, project_id: &str, trigger: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO analyses (project_id, generated_at, trigger) VALUES (?, ?, ?)
        ON CONFLICT(project_id) DO UPDATE SET generated_at = excluded.generated_at, trigger = excluded.trigger
        "#,
    )
    .bind(project_id)
    .bind(now_ts())
    .bind(trigger)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Stats ============

/// Counts shown by `docmirror status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectStats {
    pub current_files: i64,
    pub file_versions: i64,
    pub current_chunks: i64,
    pub embedded_chunks: i64,
    pub invalidated_chunks: i64,
    pub commits: i64,
    pub last_analysis_at: Option<i64>,
}

pub async fn project_stats(pool: &SqlitePool, project_id: &str) -> Result<ProjectStats> {
    let files = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN is_current = 1 THEN 1 ELSE 0 END), 0) AS current_files,
            COUNT(*) AS file_versions
        FROM repo_files WHERE project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;

    let chunks = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN is_current = 1 THEN 1 ELSE 0 END), 0) AS current_chunks,
            COALESCE(SUM(CASE WHEN is_current = 1 AND embedding IS NOT NULL THEN 1 ELSE 0 END), 0) AS embedded_chunks,
            COALESCE(SUM(CASE WHEN is_current = 0 THEN 1 ELSE 0 END), 0) AS invalidated_chunks
        FROM repo_file_chunks WHERE project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;

    Ok(ProjectStats {
        current_files: files.get("current_files"),
        file_versions: files.get("file_versions"),
        current_chunks: chunks.get("current_chunks"),
        embedded_chunks: chunks.get("embedded_chunks"),
        invalidated_chunks: chunks.get("invalidated_chunks"),
        commits: count_commits(pool, project_id).await?,
        last_analysis_at: last_analysis_at(pool, project_id).await?,
    })
}
