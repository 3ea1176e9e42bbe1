use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashSet;
use tracing::info;

use super::JobStore;
use crate::{
    db::{
        self,
        books::{Candidate, EnrichmentPredicate},
    },
    models::{
        now_micros, Error, FeedCategory, FeedSyncPayload, JobKind, JobPayload,
        MetadataScrapePayload, RetryPolicy,
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub feed_sync: usize,
    pub missing_isbn: usize,
    pub missing_details: usize,
}

impl GenerationReport {
    pub const fn total(&self) -> usize {
        self.feed_sync + self.missing_isbn + self.missing_details
    }
}

/// Builds job batches from catalog state. Each batch, including the optional
/// clear, holds the write lock from its first statement and commits or rolls
/// back as a whole.
#[derive(Debug, Clone)]
pub struct JobGenerator {
    store: JobStore,
    retry: RetryPolicy,
}

impl JobGenerator {
    pub fn new(store: JobStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// One `feed_sync` job per category. Never deduplicated.
    pub async fn generate_feed_sync(&self, clear: bool) -> Result<usize, Error> {
        let kind = JobKind::FeedSync;
        let mut conn = db::begin_immediate(self.store.pool()).await?;
        let res = self.feed_sync_batch(&mut conn, clear).await;
        let (cleared, enqueued) = db::end_immediate(&mut conn, res).await?;
        info!({ job_type = %kind, cleared, enqueued }, "generated");
        Ok(enqueued)
    }

    /// One `metadata_scrape` job per candidate book that has no queued work yet.
    pub async fn generate_metadata_scrape(
        &self,
        predicate: EnrichmentPredicate,
        clear: bool,
    ) -> Result<usize, Error> {
        let kind = JobKind::MetadataScrape;
        let mut conn = db::begin_immediate(self.store.pool()).await?;
        let res = self.metadata_scrape_batch(&mut conn, predicate, clear).await;
        let (cleared, found, enqueued) = db::end_immediate(&mut conn, res).await?;
        info!(
            { job_type = %kind, predicate = ?predicate, cleared, found, enqueued },
            "generated"
        );
        Ok(enqueued)
    }

    async fn feed_sync_batch(
        &self,
        conn: &mut SqliteConnection,
        clear: bool,
    ) -> Result<(u64, usize), Error> {
        let kind = JobKind::FeedSync;
        let cleared = if clear {
            db::jobqueue::delete_by_type(&mut *conn, kind.as_str()).await?
        } else {
            0
        };
        let now = now_micros();
        for feed_name in FeedCategory::ALL {
            let payload = JobPayload::FeedSync(FeedSyncPayload { feed_name }).to_json()?;
            db::jobqueue::insert(&mut *conn, kind.as_str(), &payload, now).await?;
        }
        Ok((cleared, FeedCategory::ALL.len()))
    }

    async fn metadata_scrape_batch(
        &self,
        conn: &mut SqliteConnection,
        predicate: EnrichmentPredicate,
        clear: bool,
    ) -> Result<(u64, usize, usize), Error> {
        let kind = JobKind::MetadataScrape;
        let cleared = if clear {
            db::jobqueue::delete_by_type(&mut *conn, kind.as_str()).await?
        } else {
            0
        };
        let now = now_micros();
        let queued: HashSet<i64> =
            db::jobqueue::active_targets(&mut *conn, kind.as_str(), self.retry.failed_cutoff(now))
                .await?
                .into_iter()
                .collect();
        let candidates = db::books::query_candidates(&mut *conn, predicate).await?;
        let found = candidates.len();
        let mut enqueued = 0;
        for candidate in candidates.into_iter().filter(|c| !queued.contains(&c.id)) {
            let payload = scrape_payload(candidate, predicate).to_json()?;
            db::jobqueue::insert(&mut *conn, kind.as_str(), &payload, now).await?;
            enqueued += 1;
        }
        Ok((cleared, found, enqueued))
    }

    /// Feed sync, then both enrichment passes. Only the first enrichment pass
    /// clears, so the second does not wipe what the first enqueued.
    pub async fn generate_all(&self, clear: bool) -> Result<GenerationReport, Error> {
        let feed_sync = self.generate_feed_sync(clear).await?;
        let missing_isbn = self
            .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, clear)
            .await?;
        let missing_details = self
            .generate_metadata_scrape(EnrichmentPredicate::MissingDetails, false)
            .await?;
        Ok(GenerationReport {
            feed_sync,
            missing_isbn,
            missing_details,
        })
    }
}

fn scrape_payload(candidate: Candidate, predicate: EnrichmentPredicate) -> JobPayload {
    let isbn = match predicate {
        EnrichmentPredicate::MissingIsbn => None,
        EnrichmentPredicate::MissingDetails => candidate.isbn,
    };
    JobPayload::MetadataScrape(MetadataScrapePayload {
        book_id: candidate.id,
        title: candidate.title,
        author: candidate.author.unwrap_or_default(),
        isbn,
    })
}

#[cfg(test)]
async fn seeded_generator(retry: RetryPolicy) -> anyhow::Result<JobGenerator> {
    let pool = db::test_pool().await?;
    db::books::insert_plain(&pool, "Like Love", "Michele Filgate", None).await?;
    db::books::insert_plain(&pool, "The Ottomans", "Marc David Baer", None).await?;
    db::books::insert_plain(&pool, "Emotional Labor", "Rose Hackman", Some("9781250777355")).await?;
    Ok(JobGenerator::new(JobStore::new(pool), retry))
}

#[tokio::test]
async fn generate_metadata_scrape_dedup_without_clear() -> anyhow::Result<()> {
    // arrange
    let generator = seeded_generator(RetryPolicy::Immediate).await?;

    // act
    let first = generator
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
        .await?;
    let second = generator
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
        .await?;

    // assert
    assert_eq!(2, first);
    assert_eq!(0, second);
    assert_eq!(2, generator.store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn generate_metadata_scrape_with_clear_is_stable() -> anyhow::Result<()> {
    // arrange
    let generator = seeded_generator(RetryPolicy::Immediate).await?;

    // act
    let first = generator
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, true)
        .await?;
    let second = generator
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, true)
        .await?;

    // assert
    assert_eq!(first, second);
    assert_eq!(2, generator.store.list().await?.len());
    Ok(())
}

#[tokio::test]
async fn generate_feed_sync_not_deduplicated() -> anyhow::Result<()> {
    // arrange
    let generator = seeded_generator(RetryPolicy::Immediate).await?;

    // act
    generator.generate_feed_sync(false).await?;
    generator.generate_feed_sync(false).await?;
    let after_clear = generator.generate_feed_sync(true).await?;

    // assert
    assert_eq!(3, after_clear);
    let jobs = generator.store.list().await?;
    assert_eq!(3, jobs.len());
    assert!(jobs.iter().all(|j| j.job_type == "feed_sync"));
    Ok(())
}

#[tokio::test]
async fn generate_all_report() -> anyhow::Result<()> {
    // arrange
    let generator = seeded_generator(RetryPolicy::Immediate).await?;

    // act
    let report = generator.generate_all(true).await?;
    let jobs = generator.store.list().await?;

    // assert
    assert_eq!(
        GenerationReport {
            feed_sync: 3,
            missing_isbn: 2,
            missing_details: 1
        },
        report
    );
    assert_eq!(report.total(), jobs.len());
    let with_isbn = jobs
        .iter()
        .filter(|j| j.payload.contains(r#""isbn":"9781250777355""#))
        .count();
    assert_eq!(1, with_isbn);
    Ok(())
}

#[tokio::test]
async fn generate_metadata_scrape_retry_policy() -> anyhow::Result<()> {
    // arrange
    let immediate = seeded_generator(RetryPolicy::Immediate).await?;
    let never = seeded_generator(RetryPolicy::Never).await?;
    for generator in [&immediate, &never] {
        generator
            .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
            .await?;
        while let Some(job) = generator.store.claim_next().await? {
            generator.store.mark_failed(job.id, "Fetch Error - 503").await?;
        }
    }

    // act
    let retried = immediate
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
        .await?;
    let blocked = never
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
        .await?;
    let cleared = never
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, true)
        .await?;

    // assert
    assert_eq!(2, retried);
    assert_eq!(0, blocked);
    assert_eq!(2, cleared);
    Ok(())
}

#[tokio::test]
async fn generate_metadata_scrape_ignores_text_book_id() -> anyhow::Result<()> {
    // arrange
    let generator = seeded_generator(RetryPolicy::Immediate).await?;
    generator
        .store
        .enqueue_raw("metadata_scrape", r#"{"bookId":"1","title":"Like Love","author":"Michele Filgate"}"#)
        .await?;

    // act
    let enqueued = generator
        .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
        .await?;

    // assert
    assert_eq!(2, enqueued);
    assert_eq!(3, generator.store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn generate_metadata_scrape_with_claim_committed_meanwhile() -> anyhow::Result<()> {
    // arrange
    let (_dir, pool) = db::file_pool().await?;
    db::books::insert_plain(&pool, "Like Love", "Michele Filgate", None).await?;
    db::books::insert_plain(&pool, "The Ottomans", "Marc David Baer", None).await?;
    let generator = JobGenerator::new(JobStore::new(pool.clone()), RetryPolicy::Immediate);
    let feed = generator
        .store
        .enqueue_raw("feed_sync", r#"{"feed_name":"read"}"#)
        .await?;
    let mut worker = db::begin_immediate(&pool).await?;

    // act
    let generation = tokio::spawn({
        let generator = generator.clone();
        async move {
            generator
                .generate_metadata_scrape(EnrichmentPredicate::MissingIsbn, false)
                .await
        }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let claimed = db::jobqueue::claim_next(&mut *worker, now_micros()).await?;
    db::end_immediate(&mut worker, Ok(())).await?;
    drop(worker);
    let enqueued = generation.await??;

    // assert
    assert_eq!(Some(feed.id), claimed.map(|j| j.id));
    assert_eq!(2, enqueued);
    assert_eq!(3, generator.store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn generate_all_alongside_worker() -> anyhow::Result<()> {
    // arrange
    let (_dir, pool) = db::file_pool().await?;
    db::books::insert_plain(&pool, "Like Love", "Michele Filgate", None).await?;
    db::books::insert_plain(&pool, "Emotional Labor", "Rose Hackman", Some("9781250777355")).await?;
    let generator = JobGenerator::new(JobStore::new(pool.clone()), RetryPolicy::Immediate);
    let store = generator.store.clone();

    // act
    let worker = tokio::spawn(async move {
        let mut processed = 0;
        for _ in 0..200 {
            match store.claim_next().await? {
                Some(job) => {
                    store.mark_completed(job.id).await?;
                    processed += 1;
                }
                None => tokio::task::yield_now().await,
            }
        }
        Ok::<_, Error>(processed)
    });
    let mut generated = 0;
    for _ in 0..5 {
        generated += generator.generate_all(false).await?.total();
    }
    let processed = worker.await??;

    // assert
    assert!(generated >= 5 * 3);
    let active = generator.store.count_active().await?;
    assert_eq!(generated as i64, processed + active);
    Ok(())
}
