use crate::models::{Error, JobRow, JobStatus};
use sqlx::{Executor, Pool, Sqlite};

const COLUMNS: &str = "id, job_type, job_status, payload, created_at, updated_at, message";

pub async fn insert<'e, E>(
    executor: E,
    job_type: &str,
    payload: &str,
    created_at: i64,
) -> Result<JobRow, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO job_queue (job_type, payload, created_at) VALUES ($1, $2, $3) RETURNING {COLUMNS}"
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_type)
        .bind(payload)
        .bind(created_at)
        .fetch_one(executor)
        .await?;
    Ok(row)
}

pub async fn delete_by_type<'e, E>(executor: E, job_type: &str) -> Result<u64, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    const SQL: &str = "DELETE FROM job_queue WHERE job_type = $1";
    let res = sqlx::query(SQL).bind(job_type).execute(executor).await?;
    Ok(res.rows_affected())
}

/// Claims the oldest pending job unless another one is still running.
/// One statement, so SQLite's write lock makes select-and-mark atomic.
pub async fn claim_next<'e, E>(executor: E, now: i64) -> Result<Option<JobRow>, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "UPDATE job_queue SET job_status = 'running', updated_at = $1
        WHERE id = (
            SELECT id FROM job_queue
            WHERE job_status = 'pending'
              AND NOT EXISTS (SELECT 1 FROM job_queue WHERE job_status = 'running')
            ORDER BY created_at, id
            LIMIT 1
        )
        RETURNING {COLUMNS}"
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(now)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Moves a running job to a terminal status. Jobs in any other status are left untouched.
pub async fn finish(
    pool: &Pool<Sqlite>,
    job_id: i64,
    status: JobStatus,
    message: Option<&str>,
    now: i64,
) -> Result<u64, Error> {
    const SQL: &str = "UPDATE job_queue SET job_status = $2, message = $3, updated_at = $4
        WHERE id = $1 AND job_status = 'running'";
    let res = sqlx::query(SQL)
        .bind(job_id)
        .bind(status)
        .bind(message)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn fail_running(pool: &Pool<Sqlite>, message: &str, now: i64) -> Result<u64, Error> {
    const SQL: &str = "UPDATE job_queue SET job_status = 'failed', message = $1, updated_at = $2
        WHERE job_status = 'running'";
    let res = sqlx::query(SQL).bind(message).bind(now).execute(pool).await?;
    Ok(res.rows_affected())
}

pub async fn get_by_id(pool: &Pool<Sqlite>, job_id: i64) -> Result<Option<JobRow>, Error> {
    let sql = format!("SELECT {COLUMNS} FROM job_queue WHERE id = $1");
    let job = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

pub async fn get_all(pool: &Pool<Sqlite>) -> Result<Vec<JobRow>, Error> {
    let sql = format!("SELECT {COLUMNS} FROM job_queue ORDER BY created_at, id");
    let jobs = sqlx::query_as::<_, JobRow>(&sql).fetch_all(pool).await?;
    Ok(jobs)
}

pub async fn count_active(pool: &Pool<Sqlite>) -> Result<i64, Error> {
    const SQL: &str =
        "SELECT COUNT(*) FROM job_queue WHERE job_status = 'pending' OR job_status = 'running'";
    let count = sqlx::query_scalar::<_, i64>(SQL).fetch_one(pool).await?;
    Ok(count)
}

/// Book ids already targeted by queued work of `job_type`: pending or running
/// jobs, plus failed jobs updated after `failed_cutoff`. Payloads without an
/// integer `bookId` target nothing.
pub async fn active_targets<'e, E>(
    executor: E,
    job_type: &str,
    failed_cutoff: i64,
) -> Result<Vec<i64>, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    const SQL: &str = "SELECT DISTINCT json_extract(payload, '$.bookId') FROM job_queue
        WHERE job_type = $1
          AND CASE WHEN json_valid(payload) THEN json_type(payload, '$.bookId') END = 'integer'
          AND (job_status IN ('pending', 'running') OR (job_status = 'failed' AND updated_at > $2))";
    let ids = sqlx::query_scalar::<_, i64>(SQL)
        .bind(job_type)
        .bind(failed_cutoff)
        .fetch_all(executor)
        .await?;
    Ok(ids)
}
