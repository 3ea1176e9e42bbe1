use crate::models::Error;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite, SqliteConnection,
};
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};

pub mod books;
pub mod jobqueue;

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS job_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_type TEXT NOT NULL,
        job_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (job_status IN ('pending', 'running', 'completed', 'failed')),
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER,
        message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS job_queue_claim_idx ON job_queue (job_status, created_at, id)",
    "CREATE INDEX IF NOT EXISTS job_queue_type_idx ON job_queue (job_type, job_status)",
    "CREATE TABLE IF NOT EXISTS book (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        author TEXT,
        image_url TEXT,
        description TEXT,
        oku_id TEXT UNIQUE,
        goodreads_id TEXT,
        amazon_id TEXT,
        isbn TEXT,
        isbn13 TEXT,
        asin TEXT,
        publisher TEXT,
        date_published INTEGER,
        date_created INTEGER NOT NULL,
        date_updated INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS book_event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_type TEXT NOT NULL,
        book_id INTEGER NOT NULL REFERENCES book (id) ON DELETE CASCADE,
        date_created TEXT NOT NULL,
        UNIQUE (event_type, book_id, date_created)
    )",
    "CREATE TABLE IF NOT EXISTS cache_book_metadata (
        isbn TEXT PRIMARY KEY,
        json TEXT NOT NULL,
        date_updated INTEGER NOT NULL
    )",
];

pub async fn connect(database_url: &str) -> Result<Pool<Sqlite>, Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    info!({ database_url }, "database ready");
    Ok(pool)
}

async fn migrate(pool: &Pool<Sqlite>) -> Result<(), Error> {
    for sql in SCHEMA {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

/// Opens a write transaction that holds the database write lock from its
/// first statement. A deferred `BEGIN` whose first statement is a read fails
/// with `SQLITE_BUSY` on its first write if another connection committed in
/// between, and the busy timeout does not retry it.
pub async fn begin_immediate(pool: &Pool<Sqlite>) -> Result<PoolConnection<Sqlite>, Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

/// Commits on `Ok`, rolls back on `Err` and returns `res` unchanged.
pub async fn end_immediate<T>(conn: &mut SqliteConnection, res: Result<T, Error>) -> Result<T, Error> {
    match res {
        Ok(value) => {
            let committed = sqlx::query("COMMIT").execute(&mut *conn).await;
            if let Err(err) = committed {
                rollback(conn).await;
                return Err(err.into());
            }
            Ok(value)
        }
        Err(err) => {
            rollback(conn).await;
            Err(err)
        }
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(conn).await {
        warn!("rollback error {}", err);
    }
}

/// Single-connection in-memory database; every connection to
/// `sqlite::memory:` would otherwise see its own empty schema.
#[cfg(test)]
pub async fn test_pool() -> Result<Pool<Sqlite>, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Multi-connection database in a temporary file, configured like
/// [`connect`]. The file lives as long as the returned directory.
#[cfg(test)]
pub async fn file_pool() -> anyhow::Result<(tempfile::TempDir, Pool<Sqlite>)> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("shelfq.db").display());
    let pool = connect(&url).await?;
    Ok((dir, pool))
}

#[tokio::test]
async fn migrate_is_repeatable() -> anyhow::Result<()> {
    // arrange
    let pool = test_pool().await?;

    // act
    migrate(&pool).await?;
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&pool)
    .await?;

    // assert
    assert_eq!(vec!["book", "book_event", "cache_book_metadata", "job_queue"], tables);
    Ok(())
}

#[tokio::test]
async fn begin_immediate_makes_writers_wait() -> anyhow::Result<()> {
    // arrange
    let (_dir, pool) = file_pool().await?;
    let mut conn = begin_immediate(&pool).await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue")
        .fetch_one(&mut *conn)
        .await?;

    // act
    let claim = tokio::spawn({
        let pool = pool.clone();
        async move { jobqueue::claim_next(&pool, crate::models::now_micros()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let waiting = !claim.is_finished();
    jobqueue::insert(&mut *conn, "feed_sync", r#"{"feed_name":"read"}"#, 1).await?;
    end_immediate(&mut conn, Ok(())).await?;
    let claimed = claim.await??;

    // assert
    assert_eq!(0, count);
    assert!(waiting);
    assert!(claimed.is_some_and(|job| job.job_type == "feed_sync"));
    Ok(())
}

#[tokio::test]
async fn end_immediate_rolls_back_on_error() -> anyhow::Result<()> {
    // arrange
    let (_dir, pool) = file_pool().await?;
    let mut conn = begin_immediate(&pool).await?;
    jobqueue::insert(&mut *conn, "feed_sync", r#"{"feed_name":"read"}"#, 1).await?;

    // act
    let res: Result<(), Error> = end_immediate(&mut conn, Err(Error::JobNotFound(1))).await;
    drop(conn);
    let active = jobqueue::count_active(&pool).await?;

    // assert
    assert!(matches!(res, Err(Error::JobNotFound(1))));
    assert_eq!(0, active);
    Ok(())
}
