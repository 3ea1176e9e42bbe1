use tokio::{select, time};
use tracing::instrument;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

use crate::models::{AppState, Error, JobPayload, JobRecord};
use std::sync::Arc;

/// Single consumer of the job queue. Claims one job at a time, runs it and
/// records the outcome.
#[derive(Debug)]
pub struct WorkerService {
    app_state: Arc<AppState>,
}

impl WorkerService {
    pub fn new(app_state: Arc<AppState>) -> Self {
        Self { app_state }
    }

    pub async fn run(&self) -> Result<(), Error> {
        let instance_id = &self.app_state.instance_id;
        info!({ instance_id }, "start");
        let mut interval = time::interval(self.app_state.worker_options.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        while !self.app_state.shutdown_token.is_cancelled() {
            match self.run_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => (),
                Err(err) => {
                    error!({ instance_id }, "error {}", err);
                    if err.is_persistence() {
                        if let Err(err) = self.app_state.store.fail_orphaned().await {
                            error!({ instance_id }, "fail_orphaned error {}", err);
                        }
                    }
                }
            }
            select!(
                biased;
                _ = self.app_state.shutdown_token.cancelled() => {}
                _ = interval.tick() => {},
            );
        }
        info!({ instance_id }, "stop");
        Ok(())
    }

    /// Runs jobs until none is pending. Returns how many were processed.
    pub async fn drain(&self) -> Result<usize, Error> {
        let mut processed = 0;
        while !self.app_state.shutdown_token.is_cancelled() {
            match self.run_next().await? {
                Some(_) => processed += 1,
                None => break,
            }
        }
        info!({ instance_id = self.app_state.instance_id, processed }, "drained");
        Ok(processed)
    }

    /// Claims and runs the oldest pending job, returning it in its terminal
    /// state. Errors are store failures only; job failures are recorded on
    /// the job.
    pub async fn run_next(&self) -> Result<Option<JobRecord>, Error> {
        let store = &self.app_state.store;
        let Some(job) = store.claim_next().await? else {
            return Ok(None);
        };
        let job_id = job.id;
        match self.execute(&job).await {
            Ok(()) => {
                store.mark_completed(job_id).await?;
                info!({ instance_id = self.app_state.instance_id, job_id }, "completed");
            }
            Err(err) => {
                let message = err.to_string();
                store.mark_failed(job_id, &message).await?;
                warn!({ instance_id = self.app_state.instance_id, job_id }, "failed {}", message);
            }
        }
        let job = store.get(job_id).await?.ok_or(Error::JobNotFound(job_id))?;
        Ok(Some(job))
    }

    // The job is already `running` here; a payload that fails to decode is
    // failed without reaching any handler.
    #[instrument(skip_all, fields(job_id = job.id, job_type = %job.job_type))]
    async fn execute(&self, job: &JobRecord) -> Result<(), Error> {
        let payload = JobPayload::decode(&job.job_type, &job.payload)?;
        debug!("==> run");
        let work = time::timeout(
            self.app_state.worker_options.job_timeout,
            self.app_state.dispatcher.dispatch(&payload),
        );
        select!(
            biased;
            _ = self.app_state.shutdown_token.cancelled() => Err(Error::Cancelled),
            res = work => res?,
        )
    }
}

#[cfg(test)]
use crate::{
    db,
    features::{
        feeds::StubFeedSource,
        metadata::{BookMetadata, StubMetadataSource},
    },
    models::{GeneratorOptions, JobStatus, WorkerOptions},
    services::TaskDispatcher,
};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
async fn test_state(metadata: StubMetadataSource, job_timeout: Duration) -> anyhow::Result<Arc<AppState>> {
    let pool = db::test_pool().await?;
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        Arc::new(metadata),
    );
    let generator_options = GeneratorOptions {
        on_start: false,
        clear_on_start: false,
        schedule: None,
        retry: Default::default(),
    };
    let worker_options = WorkerOptions {
        poll_interval: Duration::from_millis(10),
        job_timeout,
    };
    Ok(AppState::from_parts(pool, dispatcher, generator_options, worker_options))
}

#[tokio::test]
async fn run_next_malformed_payload_fails_without_handler() -> anyhow::Result<()> {
    // arrange
    let state = test_state(StubMetadataSource::default(), Duration::from_secs(5)).await?;
    let worker = WorkerService::new(state.clone());
    let job = state
        .store
        .enqueue_raw("metadata_scrape", r#"{"bookId":"seven"}"#)
        .await?;

    // act
    let done = worker.run_next().await?;

    // assert
    let done = done.ok_or_else(|| anyhow::anyhow!("nothing claimed"))?;
    assert_eq!(job.id, done.id);
    assert_eq!(JobStatus::Failed, done.status);
    assert!(done
        .message
        .as_deref()
        .is_some_and(|m| m.starts_with("Payload Decode Error - metadata_scrape")));
    assert_eq!(0, state.store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn run_next_unknown_job_type_fails() -> anyhow::Result<()> {
    // arrange
    let state = test_state(StubMetadataSource::default(), Duration::from_secs(5)).await?;
    let worker = WorkerService::new(state.clone());
    state.store.enqueue_raw("goodreads_scrape", "{}").await?;

    // act
    let done = worker.run_next().await?;
    let empty = worker.run_next().await?;

    // assert
    let done = done.ok_or_else(|| anyhow::anyhow!("nothing claimed"))?;
    assert_eq!(JobStatus::Failed, done.status);
    assert_eq!(Some("Unknown Job Type - goodreads_scrape".to_string()), done.message);
    assert!(empty.is_none());
    Ok(())
}

#[tokio::test]
async fn run_next_handler_timeout_fails() -> anyhow::Result<()> {
    // arrange
    let metadata = StubMetadataSource {
        metadata: Some(BookMetadata::default()),
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let state = test_state(metadata, Duration::from_millis(20)).await?;
    let worker = WorkerService::new(state.clone());
    state
        .store
        .enqueue_raw("metadata_scrape", r#"{"bookId":7,"title":"X","author":"Y"}"#)
        .await?;

    // act
    let done = worker.run_next().await?;

    // assert
    let done = done.ok_or_else(|| anyhow::anyhow!("nothing claimed"))?;
    assert_eq!(JobStatus::Failed, done.status);
    assert_eq!(Some("deadline has elapsed".to_string()), done.message);
    Ok(())
}

#[tokio::test]
async fn run_next_cancelled_on_shutdown() -> anyhow::Result<()> {
    // arrange
    let metadata = StubMetadataSource {
        metadata: Some(BookMetadata::default()),
        delay: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let state = test_state(metadata, Duration::from_secs(30)).await?;
    let worker = Arc::new(WorkerService::new(state.clone()));
    state
        .store
        .enqueue_raw("metadata_scrape", r#"{"bookId":7,"title":"X","author":"Y"}"#)
        .await?;

    // act
    let handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run_next().await }
    });
    time::sleep(Duration::from_millis(50)).await;
    state.shutdown_token.cancel();
    let done = handle.await??;

    // assert
    let done = done.ok_or_else(|| anyhow::anyhow!("nothing claimed"))?;
    assert_eq!(JobStatus::Failed, done.status);
    assert_eq!(Some("Cancelled".to_string()), done.message);
    Ok(())
}

#[tokio::test]
async fn drain_processes_queue_in_order() -> anyhow::Result<()> {
    // arrange
    let state = test_state(StubMetadataSource::default(), Duration::from_secs(5)).await?;
    let worker = WorkerService::new(state.clone());
    let book_id = db::books::insert_plain(&state.pool, "X", "Y", None).await?;
    let before = db::books::get_by_id(&state.pool, book_id).await?;
    let scrape = state
        .store
        .enqueue_raw(
            "metadata_scrape",
            &format!(r#"{{"bookId":{book_id},"title":"X","author":"Y"}}"#),
        )
        .await?;
    let unknown = state.store.enqueue_raw("goodreads_scrape", "{}").await?;

    // act
    let processed = worker.drain().await?;

    // assert
    assert_eq!(2, processed);
    let jobs = state.store.list().await?;
    assert_eq!(vec![scrape.id, unknown.id], jobs.iter().map(|j| j.id).collect::<Vec<_>>());
    assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
    assert_eq!(Some("Fetch Error - metadata unavailable".to_string()), jobs[0].message);
    assert_eq!(before, db::books::get_by_id(&state.pool, book_id).await?);
    Ok(())
}

#[tokio::test]
async fn run_until_shutdown() -> anyhow::Result<()> {
    // arrange
    let metadata = StubMetadataSource {
        metadata: Some(BookMetadata {
            isbn: Some("0063045168".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let state = test_state(metadata, Duration::from_secs(5)).await?;
    let book_id = db::books::insert_plain(&state.pool, "X", "Y", None).await?;
    let job = state
        .store
        .enqueue_raw(
            "metadata_scrape",
            &format!(r#"{{"bookId":{book_id},"title":"X","author":"Y"}}"#),
        )
        .await?;
    let worker = Arc::new(WorkerService::new(state.clone()));

    // act
    let handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });
    let mut active = state.store.count_active().await?;
    for _ in 0..200 {
        if active == 0 {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
        active = state.store.count_active().await?;
    }
    state.shutdown_token.cancel();
    handle.await??;

    // assert
    assert_eq!(0, active);
    let job = state.store.get(job.id).await?.ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(JobStatus::Completed, job.status);
    assert_eq!(None, job.message);
    Ok(())
}
