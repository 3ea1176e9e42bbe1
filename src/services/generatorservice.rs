use tokio::{select, time};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use super::{GenerationReport, JobGenerator};
use crate::{
    features::schedules::JobSchedule,
    models::{AppState, Error},
};
use std::{sync::Arc, time::Duration};

/// Runs job generation at startup and, when a schedule is configured, again
/// at every fire time without clearing the backlog.
#[derive(Debug)]
pub struct GeneratorService {
    app_state: Arc<AppState>,
    generator: JobGenerator,
}

impl GeneratorService {
    pub fn new(app_state: Arc<AppState>) -> Self {
        let generator = JobGenerator::new(
            app_state.store.clone(),
            app_state.generator_options.retry,
        );
        Self {
            app_state,
            generator,
        }
    }

    pub async fn generate(&self, clear: bool) -> Result<GenerationReport, Error> {
        let report = self.generator.generate_all(clear).await?;
        info!(
            {
                instance_id = self.app_state.instance_id,
                clear,
                feed_sync = report.feed_sync,
                missing_isbn = report.missing_isbn,
                missing_details = report.missing_details
            },
            "generate"
        );
        Ok(report)
    }

    pub async fn run(&self) -> Result<(), Error> {
        let instance_id = &self.app_state.instance_id;
        let Some(schedule) = self.app_state.generator_options.schedule.clone() else {
            debug!({ instance_id }, "no schedule, disabled");
            return Ok(());
        };
        info!(
            { instance_id, schedule = %schedule, retry = %self.app_state.generator_options.retry },
            "start"
        );
        while !self.app_state.shutdown_token.is_cancelled() {
            let now = JobSchedule::now_secs();
            let Some(next_at) = schedule.next(now) else {
                warn!({ instance_id, schedule = %schedule }, "no next fire time");
                break;
            };
            let delay = Duration::from_secs(u64::try_from(next_at - now).unwrap_or(0));
            trace!({ instance_id, next_at }, "sleep");
            select!(
                biased;
                _ = self.app_state.shutdown_token.cancelled() => break,
                _ = time::sleep(delay) => {},
            );
            if let Err(err) = self.generate(false).await {
                error!({ instance_id }, "error {}", err);
            }
        }
        info!({ instance_id }, "stop");
        Ok(())
    }
}

#[cfg(test)]
use crate::{
    db,
    features::{feeds::StubFeedSource, metadata::StubMetadataSource},
    models::{GeneratorOptions, RetryPolicy, WorkerOptions},
    services::TaskDispatcher,
};

#[cfg(test)]
async fn test_state(schedule: Option<JobSchedule>) -> anyhow::Result<Arc<AppState>> {
    let pool = db::test_pool().await?;
    db::books::insert_plain(&pool, "Like Love", "Michele Filgate", None).await?;
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        Arc::new(StubMetadataSource::default()),
    );
    let generator_options = GeneratorOptions {
        on_start: true,
        clear_on_start: true,
        schedule,
        retry: RetryPolicy::Immediate,
    };
    let worker_options = WorkerOptions {
        poll_interval: Duration::from_millis(10),
        job_timeout: Duration::from_secs(1),
    };
    Ok(AppState::from_parts(pool, dispatcher, generator_options, worker_options))
}

#[tokio::test]
async fn generate_keeps_queued_work_without_clear() -> anyhow::Result<()> {
    // arrange
    let state = test_state(None).await?;
    let service = GeneratorService::new(state.clone());

    // act
    let first = service.generate(true).await?;
    let second = service.generate(false).await?;

    // assert
    assert_eq!(4, first.total());
    assert_eq!(3, second.total());
    assert_eq!(0, second.missing_isbn);
    assert_eq!(7, state.store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn run_without_schedule_returns() -> anyhow::Result<()> {
    // arrange
    let state = test_state(None).await?;
    let service = GeneratorService::new(state.clone());

    // act
    service.run().await?;

    // assert
    assert_eq!(0, state.store.count_active().await?);
    Ok(())
}

#[tokio::test]
async fn run_stops_on_shutdown() -> anyhow::Result<()> {
    // arrange
    let state = test_state(Some(JobSchedule::Interval { interval: 3600 })).await?;
    let service = Arc::new(GeneratorService::new(state.clone()));
    let handle = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.run().await }
    });

    // act
    state.shutdown_token.cancel();
    let res = time::timeout(Duration::from_secs(1), handle).await??;

    // assert
    assert!(res.is_ok());
    assert_eq!(0, state.store.count_active().await?);
    Ok(())
}
