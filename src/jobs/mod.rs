//! Job store: durable persistence for analysis requests.
//!
//! Uses SQLx with SQLite for lightweight, embedded storage. One table holds
//! one row per requested track, keyed by an opaque 32-hex id, with secondary
//! lookups by video id and by (title, artist). Every mutation commits before
//! returning, so the queue survives a process crash.
//!
//! The critical operation is [`claim_next`]: a single atomic
//! `UPDATE … RETURNING` that flips the oldest queued row to `processing`,
//! guaranteeing that concurrent workers obtain distinct rows.

use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Lifecycle state of a job.
///
/// Transitions are monotone `downloading → queued → processing →
/// complete|failed`; the only way back is deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum Status {
    Downloading,
    Queued,
    Processing,
    Complete,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Downloading => "downloading",
            Status::Queued => "queued",
            Status::Processing => "processing",
            Status::Complete => "complete",
            Status::Failed => "failed",
        }
    }

    /// Whether the job is still moving through the pipeline.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Status::Downloading | Status::Queued | Status::Processing
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One analysis request.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// Opaque 32-hex identifier
    pub id: String,
    pub status: Status,
    /// Storage-root–relative staging audio path (empty while downloading)
    pub input_path: String,
    /// Storage-root–relative artifact path
    pub output_path: String,
    /// Failure message, only meaningful on `failed`
    pub error: Option<String>,
    pub track_title: Option<String>,
    pub track_artist: Option<String>,
    pub youtube_id: Option<String>,
    /// 0..=100
    pub progress: i64,
    pub play_count: i64,
    pub is_user_supplied: bool,
    /// RFC 3339 UTC timestamps
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for [`create_job`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub id: String,
    pub status: Option<Status>,
    pub input_path: String,
    pub output_path: String,
    pub track_title: Option<String>,
    pub track_artist: Option<String>,
    pub youtube_id: Option<String>,
    pub progress: i64,
    pub is_user_supplied: bool,
}

/// Entry in the top-tracks list.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct TopTrack {
    pub id: String,
    #[sqlx(rename = "track_title")]
    pub title: String,
    #[sqlx(rename = "track_artist")]
    pub artist: String,
    pub youtube_id: Option<String>,
    pub play_count: i64,
}

const JOB_COLUMNS: &str = "id, status, input_path, output_path, error, \
     track_title, track_artist, youtube_id, progress, play_count, \
     is_user_supplied, created_at, updated_at";

fn utc_now() -> String {
    Utc::now().to_rfc3339()
}

/// Generate a fresh opaque job id (32 hex chars).
pub fn new_job_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Initialize the job store connection pool and run migrations.
///
/// Creates the database file if it doesn't exist. WAL journaling plus a
/// busy timeout let several worker processes share the store.
pub async fn init_db(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options: SqliteConnectOptions = db_url.parse::<SqliteConnectOptions>()?;
    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Insert a new job row stamped with the current time.
pub async fn create_job(pool: &SqlitePool, new: NewJob) -> sqlx::Result<()> {
    let now = utc_now();
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, status, input_path, output_path, error,
            track_title, track_artist, youtube_id,
            progress, play_count, is_user_supplied, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(&new.id)
    .bind(new.status.unwrap_or(Status::Queued))
    .bind(&new.input_path)
    .bind(&new.output_path)
    .bind(&new.track_title)
    .bind(&new.track_artist)
    .bind(&new.youtube_id)
    .bind(new.progress.clamp(0, 100))
    .bind(new.is_user_supplied)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a job by id.
pub async fn get_job(pool: &SqlitePool, job_id: &str) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Newest job for a video id, if any.
pub async fn get_job_by_video(pool: &SqlitePool, youtube_id: &str) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE youtube_id = ? ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(youtube_id)
    .fetch_optional(pool)
    .await
}

/// Newest job matching (title, artist) exactly, if any.
pub async fn get_job_by_track(
    pool: &SqlitePool,
    title: &str,
    artist: &str,
) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE track_title = ? AND track_artist = ? ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(title)
    .bind(artist)
    .fetch_optional(pool)
    .await
}

/// Update status (and the failure message) for a job.
pub async fn set_status(
    pool: &SqlitePool,
    job_id: &str,
    status: Status,
    error: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(error)
        .bind(utc_now())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Set progress, clamped to 0..=100.
pub async fn set_progress(pool: &SqlitePool, job_id: &str, progress: i64) -> sqlx::Result<()> {
    sqlx::query("UPDATE jobs SET progress = ?, updated_at = ? WHERE id = ?")
        .bind(progress.clamp(0, 100))
        .bind(utc_now())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the staging audio path once a download lands.
pub async fn set_input_path(pool: &SqlitePool, job_id: &str, input_path: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE jobs SET input_path = ?, updated_at = ? WHERE id = ?")
        .bind(input_path)
        .bind(utc_now())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace the dedup metadata columns.
pub async fn update_metadata(
    pool: &SqlitePool,
    job_id: &str,
    title: Option<&str>,
    artist: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE jobs SET track_title = ?, track_artist = ?, updated_at = ? WHERE id = ?")
        .bind(title)
        .bind(artist)
        .bind(utc_now())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically bump the play counter.
///
/// Returns the new count, or `None` when no row matched. The statement
/// commits either way; callers distinguish the missing-row case purely by
/// the return value.
pub async fn increment_plays(pool: &SqlitePool, job_id: &str) -> sqlx::Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "UPDATE jobs SET play_count = play_count + 1, updated_at = ? WHERE id = ? \
         RETURNING play_count",
    )
    .bind(utc_now())
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(count,)| count))
}

/// Overwrite the play counter (admin path), clamped at zero.
pub async fn set_play_count(
    pool: &SqlitePool,
    job_id: &str,
    play_count: i64,
) -> sqlx::Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "UPDATE jobs SET play_count = ?, updated_at = ? WHERE id = ? RETURNING play_count",
    )
    .bind(play_count.max(0))
    .bind(utc_now())
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(count,)| count))
}

/// Delete a job row.
pub async fn delete_job(pool: &SqlitePool, job_id: &str) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most-played tracks eligible for the public list: named, organic
/// (not user-supplied), and actually played.
pub async fn top_tracks(pool: &SqlitePool, limit: i64) -> sqlx::Result<Vec<TopTrack>> {
    sqlx::query_as::<_, TopTrack>(
        r#"
        SELECT id, track_title, track_artist, youtube_id, play_count
        FROM jobs
        WHERE track_title IS NOT NULL
          AND track_title != ''
          AND track_artist IS NOT NULL
          AND track_artist != ''
          AND is_user_supplied = 0
          AND play_count > 0
        ORDER BY play_count DESC, updated_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Claim the oldest queued job for this worker.
///
/// The select and the status flip happen in one statement, so under any
/// number of concurrent callers each queued row is handed out exactly once.
/// The claimed row comes back already flipped to `processing`.
pub async fn claim_next(pool: &SqlitePool) -> sqlx::Result<Option<Job>> {
    sqlx::query_as::<_, Job>(&format!(
        "UPDATE jobs SET status = 'processing', progress = 0, updated_at = ? \
         WHERE id = ( \
             SELECT id FROM jobs WHERE status = 'queued' \
             ORDER BY created_at, id LIMIT 1 \
         ) \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(utc_now())
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{queued_job, temp_pool};

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let (pool, _dir) = temp_pool().await;
        create_job(&pool, queued_job("job1")).await.unwrap();

        let job = get_job(&pool, "job1").await.unwrap().unwrap();
        assert_eq!(job.status, Status::Queued);
        assert_eq!(job.output_path, "analysis/job1.json");
        assert_eq!(job.play_count, 0);
        assert!(!job.is_user_supplied);
        assert!(job.error.is_none());

        assert!(get_job(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_by_video_returns_newest() {
        let (pool, _dir) = temp_pool().await;
        let mut first = queued_job("old");
        first.youtube_id = Some("vid".into());
        create_job(&pool, first).await.unwrap();
        // Force a strictly later created_at
        sqlx::query("UPDATE jobs SET created_at = '2000-01-01T00:00:00+00:00' WHERE id = 'old'")
            .execute(&pool)
            .await
            .unwrap();
        let mut second = queued_job("new");
        second.youtube_id = Some("vid".into());
        create_job(&pool, second).await.unwrap();

        let found = get_job_by_video(&pool, "vid").await.unwrap().unwrap();
        assert_eq!(found.id, "new");
    }

    #[tokio::test]
    async fn lookup_by_track_matches_exactly() {
        let (pool, _dir) = temp_pool().await;
        let mut job = queued_job("t1");
        job.track_title = Some("Song".into());
        job.track_artist = Some("Artist".into());
        create_job(&pool, job).await.unwrap();

        assert!(
            get_job_by_track(&pool, "Song", "Artist")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            get_job_by_track(&pool, "Song", "Other")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let (pool, _dir) = temp_pool().await;
        create_job(&pool, queued_job("p1")).await.unwrap();

        set_progress(&pool, "p1", 150).await.unwrap();
        assert_eq!(get_job(&pool, "p1").await.unwrap().unwrap().progress, 100);

        set_progress(&pool, "p1", -3).await.unwrap();
        assert_eq!(get_job(&pool, "p1").await.unwrap().unwrap().progress, 0);
    }

    #[tokio::test]
    async fn claim_next_takes_oldest_and_flips_status() {
        let (pool, _dir) = temp_pool().await;
        create_job(&pool, queued_job("b")).await.unwrap();
        sqlx::query("UPDATE jobs SET created_at = '2001-01-01T00:00:00+00:00' WHERE id = 'b'")
            .execute(&pool)
            .await
            .unwrap();
        create_job(&pool, queued_job("a")).await.unwrap();
        sqlx::query("UPDATE jobs SET created_at = '2000-01-01T00:00:00+00:00' WHERE id = 'a'")
            .execute(&pool)
            .await
            .unwrap();

        let claimed = claim_next(&pool).await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.status, Status::Processing);
        assert_eq!(claimed.progress, 0);

        let second = claim_next(&pool).await.unwrap().unwrap();
        assert_eq!(second.id, "b");

        assert!(claim_next(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_next_is_exclusive_under_contention() {
        let (pool, _dir) = temp_pool().await;
        create_job(&pool, queued_job("only")).await.unwrap();

        let (left, right) = tokio::join!(claim_next(&pool), claim_next(&pool));
        let claims = [left.unwrap(), right.unwrap()];
        let won = claims.iter().filter(|c| c.is_some()).count();
        assert_eq!(won, 1, "exactly one caller may claim the row");
    }

    #[tokio::test]
    async fn increment_plays_missing_row() {
        let (pool, _dir) = temp_pool().await;
        // The update commits even though nothing matched; callers rely on
        // the None return to distinguish the case.
        assert_eq!(increment_plays(&pool, "ghost").await.unwrap(), None);

        create_job(&pool, queued_job("real")).await.unwrap();
        assert_eq!(increment_plays(&pool, "real").await.unwrap(), Some(1));
        assert_eq!(increment_plays(&pool, "real").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn set_play_count_clamps_at_zero() {
        let (pool, _dir) = temp_pool().await;
        create_job(&pool, queued_job("pc")).await.unwrap();
        assert_eq!(set_play_count(&pool, "pc", -5).await.unwrap(), Some(0));
        assert_eq!(set_play_count(&pool, "pc", 7).await.unwrap(), Some(7));
        assert_eq!(set_play_count(&pool, "ghost", 7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn top_tracks_filters_and_orders() {
        let (pool, _dir) = temp_pool().await;

        let mut named = queued_job("named");
        named.track_title = Some("Song".into());
        named.track_artist = Some("Artist".into());
        create_job(&pool, named).await.unwrap();
        set_play_count(&pool, "named", 3).await.unwrap();

        let mut busier = queued_job("busier");
        busier.track_title = Some("Hit".into());
        busier.track_artist = Some("Star".into());
        create_job(&pool, busier).await.unwrap();
        set_play_count(&pool, "busier", 9).await.unwrap();

        // Ineligible rows: unplayed, user-supplied, unnamed
        let mut unplayed = queued_job("unplayed");
        unplayed.track_title = Some("Quiet".into());
        unplayed.track_artist = Some("Band".into());
        create_job(&pool, unplayed).await.unwrap();

        let mut user = queued_job("user");
        user.track_title = Some("Mine".into());
        user.track_artist = Some("Me".into());
        user.is_user_supplied = true;
        create_job(&pool, user).await.unwrap();
        set_play_count(&pool, "user", 5).await.unwrap();

        create_job(&pool, queued_job("anon")).await.unwrap();
        set_play_count(&pool, "anon", 4).await.unwrap();

        let top = top_tracks(&pool, 10).await.unwrap();
        let ids: Vec<&str> = top.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["busier", "named"]);
        assert_eq!(top[0].play_count, 9);
    }

    #[tokio::test]
    async fn status_update_records_error() {
        let (pool, _dir) = temp_pool().await;
        create_job(&pool, queued_job("s")).await.unwrap();
        set_status(&pool, "s", Status::Failed, Some("engine exited with status 1"))
            .await
            .unwrap();
        let job = get_job(&pool, "s").await.unwrap().unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.error.as_deref(), Some("engine exited with status 1"));
    }

    #[test]
    fn job_ids_are_32_hex() {
        let id = new_job_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_job_id());
    }
}
