use sqlx::{Pool, Sqlite};
#[allow(unused_imports)]
use tracing::{debug, info, warn};

use crate::{
    db,
    models::{now_micros, Error, JobKind, JobPayload, JobRecord, JobStatus},
};

pub const ORPHANED: &str = "orphaned";

/// Durable queue over the `job_queue` table. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn enqueue(&self, payload: &JobPayload) -> Result<JobRecord, Error> {
        let json = payload.to_json()?;
        self.enqueue_raw(payload.kind().as_str(), &json).await
    }

    /// Stores tag and payload verbatim; nothing is validated until the job is claimed.
    pub async fn enqueue_raw(&self, job_type: &str, payload: &str) -> Result<JobRecord, Error> {
        let row = db::jobqueue::insert(&self.pool, job_type, payload, now_micros()).await?;
        debug!({ job_id = row.id, job_type }, "enqueued");
        Ok(row.into())
    }

    /// Deletes every record of `kind`, whatever its status.
    pub async fn clear_pending(&self, kind: JobKind) -> Result<u64, Error> {
        let deleted = db::jobqueue::delete_by_type(&self.pool, kind.as_str()).await?;
        info!({ job_type = %kind, deleted }, "cleared");
        Ok(deleted)
    }

    /// Oldest pending job, now `running`. `None` while another job is running.
    pub async fn claim_next(&self) -> Result<Option<JobRecord>, Error> {
        let row = db::jobqueue::claim_next(&self.pool, now_micros()).await?;
        Ok(row.map(JobRecord::from))
    }

    pub async fn mark_completed(&self, job_id: i64) -> Result<bool, Error> {
        self.finish(job_id, JobStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, job_id: i64, message: &str) -> Result<bool, Error> {
        self.finish(job_id, JobStatus::Failed, Some(message)).await
    }

    async fn finish(&self, job_id: i64, status: JobStatus, message: Option<&str>) -> Result<bool, Error> {
        debug_assert!(status.is_terminal());
        let rows = db::jobqueue::finish(&self.pool, job_id, status, message, now_micros()).await?;
        if rows > 0 {
            return Ok(true);
        }
        let job = db::jobqueue::get_by_id(&self.pool, job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        warn!({ job_id, status = ?job.job_status }, "not running, status kept");
        Ok(false)
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>, Error> {
        let rows = db::jobqueue::get_all(&self.pool).await?;
        Ok(rows.into_iter().map(JobRecord::from).collect())
    }

    pub async fn count_active(&self) -> Result<i64, Error> {
        db::jobqueue::count_active(&self.pool).await
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<JobRecord>, Error> {
        let row = db::jobqueue::get_by_id(&self.pool, job_id).await?;
        Ok(row.map(JobRecord::from))
    }

    /// Fails every `running` job. Only called when no job of this process is in flight.
    pub async fn fail_orphaned(&self) -> Result<u64, Error> {
        let failed = db::jobqueue::fail_running(&self.pool, ORPHANED, now_micros()).await?;
        if failed > 0 {
            warn!({ failed }, "orphaned jobs failed");
        }
        Ok(failed)
    }
}

#[cfg(test)]
fn scrape(book_id: i64) -> JobPayload {
    JobPayload::MetadataScrape(crate::models::MetadataScrapePayload {
        book_id,
        title: format!("Book {book_id}"),
        author: "Anon".into(),
        isbn: None,
    })
}

#[tokio::test]
async fn claim_next_empty() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);

    // act
    let claimed = store.claim_next().await?;

    // assert
    assert!(claimed.is_none());
    assert_eq!(0, store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn claim_next_single_in_flight() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);
    let a = store.enqueue(&scrape(1)).await?;
    let b = store.enqueue(&scrape(2)).await?;

    // act
    let first = store.claim_next().await?;
    let blocked = store.claim_next().await?;
    store.mark_completed(a.id).await?;
    let second = store.claim_next().await?;

    // assert
    assert_eq!(Some(a.id), first.as_ref().map(|j| j.id));
    assert_eq!(Some(JobStatus::Running), first.map(|j| j.status));
    assert!(blocked.is_none());
    assert_eq!(Some(b.id), second.map(|j| j.id));
    Ok(())
}

#[tokio::test]
async fn claim_next_orders_by_created_at_then_id() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);
    let pool = store.pool();
    let late = db::jobqueue::insert(pool, "feed_sync", r#"{"feed_name":"read"}"#, 20).await?;
    let tie_low = db::jobqueue::insert(pool, "feed_sync", r#"{"feed_name":"reading"}"#, 10).await?;
    let tie_high = db::jobqueue::insert(pool, "feed_sync", r#"{"feed_name":"not-read"}"#, 10).await?;

    // act
    let mut claimed = Vec::new();
    while let Some(job) = store.claim_next().await? {
        claimed.push(job.id);
        store.mark_completed(job.id).await?;
    }

    // assert
    assert_eq!(vec![tie_low.id, tie_high.id, late.id], claimed);
    Ok(())
}

#[tokio::test]
async fn mark_terminal_is_stable() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);
    let job = store.enqueue(&scrape(7)).await?;
    let pending = store.mark_completed(job.id).await?;
    store.claim_next().await?;

    // act
    let failed = store.mark_failed(job.id, "boom").await?;
    let completed_after = store.mark_completed(job.id).await?;
    let record = store.get(job.id).await?;

    // assert
    assert!(!pending);
    assert!(failed);
    assert!(!completed_after);
    let record = record.ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(JobStatus::Failed, record.status);
    assert!(record.status.is_terminal());
    assert!(!JobStatus::Running.is_terminal());
    assert_eq!(Some("boom".to_string()), record.message);
    assert!(record.updated_at.is_some());
    Ok(())
}

#[tokio::test]
async fn mark_missing_job_not_found() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);

    // act
    let res = store.mark_completed(404).await;

    // assert
    assert!(matches!(res, Err(Error::JobNotFound(404))));
    Ok(())
}

#[tokio::test]
async fn fail_orphaned_unblocks_claim() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);
    let stuck = store.enqueue(&scrape(1)).await?;
    let next = store.enqueue(&scrape(2)).await?;
    store.claim_next().await?;

    // act
    let failed = store.fail_orphaned().await?;
    let claimed = store.claim_next().await?;

    // assert
    assert_eq!(1, failed);
    let stuck = store.get(stuck.id).await?.ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(JobStatus::Failed, stuck.status);
    assert_eq!(Some(ORPHANED.to_string()), stuck.message);
    assert_eq!(Some(next.id), claimed.map(|j| j.id));
    Ok(())
}

#[tokio::test]
async fn enqueue_raw_and_clear_pending() -> anyhow::Result<()> {
    // arrange
    let store = JobStore::new(db::test_pool().await?);
    let raw = store.enqueue_raw("goodreads_scrape", "not json").await?;
    store.enqueue(&scrape(1)).await?;
    store.enqueue(&scrape(2)).await?;
    store.claim_next().await?;

    // act
    let cleared = store.clear_pending(JobKind::MetadataScrape).await?;
    let left = store.list().await?;

    // assert
    assert_eq!(2, cleared);
    assert_eq!(1, left.len());
    assert_eq!(raw.id, left[0].id);
    assert_eq!("goodreads_scrape", left[0].job_type);
    assert_eq!("not json", left[0].payload);
    Ok(())
}

#[tokio::test]
async fn claim_next_concurrent_single_winner() -> anyhow::Result<()> {
    // arrange
    let (_dir, pool) = db::file_pool().await?;
    let store = JobStore::new(pool);
    for book_id in 1..=3 {
        store.enqueue(&scrape(book_id)).await?;
    }

    // act
    let claims: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next().await })
        })
        .collect();
    let mut claimed = Vec::new();
    for claim in claims {
        if let Some(job) = claim.await?? {
            claimed.push(job);
        }
    }

    // assert
    assert_eq!(1, claimed.len());
    let running = store
        .list()
        .await?
        .into_iter()
        .filter(|j| j.status == JobStatus::Running)
        .map(|j| j.id)
        .collect::<Vec<_>>();
    assert_eq!(vec![claimed[0].id], running);
    Ok(())
}
