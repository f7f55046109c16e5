use super::model::{DispatchRunRow, StoredContent};
use crate::model::{ContentType, DiaryContentRecord, DispatchOutcome, DispatchSummary};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use std::str::FromStr;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {normalized}"))?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open {normalized}"))?;
    // WAL keeps readers going while a run writes its summary.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// Expand `~/` in file-backed SQLite URLs and create the parent directory.
/// In-memory and non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<DiaryContentRecord> {
    let kind: String = row.try_get("kind")?;
    let kind = ContentType::from_code(&kind).ok_or_else(|| anyhow!("unknown content type {kind:?}"))?;
    Ok(DiaryContentRecord {
        id: row.try_get("id")?,
        content_id: row.try_get("content_id")?,
        date: row.try_get::<NaiveDate, _>("date")?,
        time_range: row.try_get("time_range")?,
        kind,
        content: row.try_get("content")?,
        observations: row.try_get("observations")?,
        original_content_id: row.try_get("original_content_id")?,
        original_date: row.try_get::<Option<NaiveDate>, _>("original_date")?,
        is_non_presential: row.try_get("is_non_presential")?,
    })
}

const SELECT_CONTENT: &str = "SELECT id, diary_id, content_id, date, time_range, kind, content, \
     observations, original_content_id, original_date, is_non_presential, edited_at \
     FROM diary_contents";

/// Insert or refresh records pulled from upstream. Texts edited locally and
/// not yet pushed are kept.
#[instrument(skip_all, fields(diary_id = %diary_id, count = records.len()))]
pub async fn upsert_records(
    pool: &Pool,
    diary_id: &str,
    records: &[DiaryContentRecord],
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for r in records {
        sqlx::query(
            "INSERT INTO diary_contents (id, diary_id, content_id, date, time_range, kind, content, \
             observations, original_content_id, original_date, is_non_presential) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               diary_id = excluded.diary_id, \
               content_id = excluded.content_id, \
               date = excluded.date, \
               time_range = excluded.time_range, \
               kind = excluded.kind, \
               content = CASE WHEN diary_contents.edited_at IS NULL THEN excluded.content ELSE diary_contents.content END, \
               observations = CASE WHEN diary_contents.edited_at IS NULL THEN excluded.observations ELSE diary_contents.observations END, \
               original_content_id = excluded.original_content_id, \
               original_date = excluded.original_date, \
               is_non_presential = excluded.is_non_presential, \
               synced_at = datetime('now')",
        )
        .bind(&r.id)
        .bind(diary_id)
        .bind(&r.content_id)
        .bind(r.date)
        .bind(&r.time_range)
        .bind(r.kind.as_str())
        .bind(&r.content)
        .bind(&r.observations)
        .bind(&r.original_content_id)
        .bind(r.original_date)
        .bind(r.is_non_presential)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(records.len())
}

#[instrument(skip_all, fields(diary_id = %diary_id))]
pub async fn list_diary_content(pool: &Pool, diary_id: &str) -> Result<Vec<DiaryContentRecord>> {
    let rows = sqlx::query(&format!(
        "{SELECT_CONTENT} WHERE diary_id = ? ORDER BY date, time_range, id"
    ))
    .bind(diary_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

#[instrument(skip_all, fields(id = %id))]
pub async fn get_content(pool: &Pool, id: &str) -> Result<Option<StoredContent>> {
    let row = sqlx::query(&format!("{SELECT_CONTENT} WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|row| {
        Ok(StoredContent {
            diary_id: row.try_get("diary_id")?,
            edited: row.try_get::<Option<String>, _>("edited_at")?.is_some(),
            record: record_from_row(&row)?,
        })
    })
    .transpose()
}

/// Replace a slot's texts. Returns false when no such slot exists.
#[instrument(skip_all, fields(id = %id))]
pub async fn save_content_edit(
    pool: &Pool,
    id: &str,
    content: &str,
    observations: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE diary_contents SET content = ?, observations = COALESCE(?, observations), \
         edited_at = datetime('now') WHERE id = ?",
    )
    .bind(content)
    .bind(observations)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Slots of a diary whose local texts have not reached upstream yet.
#[instrument(skip_all, fields(diary_id = %diary_id))]
pub async fn list_pending_edits(pool: &Pool, diary_id: &str) -> Result<Vec<DiaryContentRecord>> {
    let rows = sqlx::query(&format!(
        "{SELECT_CONTENT} WHERE diary_id = ? AND edited_at IS NOT NULL ORDER BY date, time_range, id"
    ))
    .bind(diary_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

/// Forget the local-edit marker once the text is known upstream.
pub async fn mark_edit_pushed(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query("UPDATE diary_contents SET edited_at = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all, fields(run_id = %run_id, diary_id = %diary_id))]
pub async fn record_dispatch_run(
    pool: &Pool,
    run_id: &str,
    diary_id: &str,
    summary: &DispatchSummary,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO dispatch_runs (id, diary_id, total, succeeded, failed) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(diary_id)
    .bind(summary.total as i64)
    .bind(summary.succeeded as i64)
    .bind(summary.failed as i64)
    .execute(&mut *tx)
    .await?;
    for (position, outcome) in summary.results.iter().enumerate() {
        sqlx::query(
            "INSERT INTO dispatch_results (run_id, position, content_id, success, message) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(position as i64)
        .bind(&outcome.content_id)
        .bind(outcome.success)
        .bind(&outcome.message)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn list_dispatch_runs(pool: &Pool, diary_id: &str) -> Result<Vec<DispatchRunRow>> {
    let rows = sqlx::query(
        "SELECT id, diary_id, total, succeeded, failed, finished_at FROM dispatch_runs \
         WHERE diary_id = ? ORDER BY finished_at DESC, rowid DESC",
    )
    .bind(diary_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(DispatchRunRow {
                id: row.try_get("id")?,
                diary_id: row.try_get("diary_id")?,
                total: row.try_get("total")?,
                succeeded: row.try_get("succeeded")?,
                failed: row.try_get("failed")?,
                finished_at: row.try_get("finished_at")?,
            })
        })
        .collect()
}

pub async fn dispatch_results(pool: &Pool, run_id: &str) -> Result<Vec<DispatchOutcome>> {
    let rows = sqlx::query(
        "SELECT content_id, success, message FROM dispatch_results WHERE run_id = ? ORDER BY position",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(DispatchOutcome {
                content_id: row.try_get("content_id")?,
                success: row.try_get("success")?,
                message: row.try_get("message")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::prepare_sqlite_url;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_are_normalized() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/plania.db");
        let url = prepare_sqlite_url(&format!("sqlite:{}?mode=rwc", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }
}
