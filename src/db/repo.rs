use super::model::{CachedProfile, SessionKind, StoredSession};
use crate::model::UserProfile;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("open local store {}", normalized))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// URL of the store file inside `data_dir`, created on first open.
pub fn store_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join("session.db").display())
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through.
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
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("corrupt user id in local store: {}", raw))
}

fn session_from_row(row: &SqliteRow) -> Result<StoredSession> {
    let kind: String = row.try_get("kind")?;
    let user_id: String = row.try_get("user_id")?;
    Ok(StoredSession {
        session_id: row.try_get("session_id")?,
        kind: SessionKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown session kind {}", kind))?,
        user_id: parse_uuid(&user_id)?,
        email: row.try_get("email")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
    })
}

/// Replace the persisted session; at most one is kept.
#[instrument(skip_all)]
pub async fn save_session(pool: &Pool, session: &StoredSession) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM sessions")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO sessions (session_id, kind, user_id, email, access_token, refresh_token, expires_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&session.session_id)
    .bind(session.kind.as_str())
    .bind(session.user_id.to_string())
    .bind(&session.email)
    .bind(&session.access_token)
    .bind(&session.refresh_token)
    .bind(session.expires_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_session(pool: &Pool) -> Result<Option<StoredSession>> {
    let row = sqlx::query(
        "SELECT session_id, kind, user_id, email, access_token, refresh_token, expires_at \
         FROM sessions ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(session_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn clear_session(pool: &Pool) -> Result<()> {
    sqlx::query("DELETE FROM sessions").execute(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn put_profile(pool: &Pool, profile: &UserProfile, fetched_at: DateTime<Utc>) -> Result<()> {
    let json = serde_json::to_string(profile)?;
    sqlx::query(
        "INSERT INTO profile_cache (user_id, profile_json, fetched_at) VALUES (?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET profile_json = excluded.profile_json, fetched_at = excluded.fetched_at",
    )
    .bind(profile.id.to_string())
    .bind(json)
    .bind(fetched_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_profile(pool: &Pool, user_id: Uuid) -> Result<Option<CachedProfile>> {
    let row = sqlx::query("SELECT profile_json, fetched_at FROM profile_cache WHERE user_id = ?")
        .bind(user_id.to_string())
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let json: String = row.try_get("profile_json")?;
    Ok(Some(CachedProfile {
        profile: serde_json::from_str(&json).context("decode cached profile")?,
        fetched_at: row.try_get("fetched_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn drop_profile(pool: &Pool, user_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM profile_cache WHERE user_id = ?")
        .bind(user_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
