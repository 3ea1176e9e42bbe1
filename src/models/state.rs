use dotenv::dotenv;
use sqlx::{Pool, Sqlite};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Error, RetryPolicy};
use crate::{
    db,
    features::{
        fetch,
        feeds::HttpFeedSource,
        metadata::HttpMetadataSource,
        schedules::JobSchedule,
    },
    services::{JobStore, TaskDispatcher},
};

#[derive(Debug)]
pub struct AppState {
    pub instance_id: String,
    pub pool: Pool<Sqlite>,
    pub store: JobStore,
    pub dispatcher: Arc<TaskDispatcher>,
    pub generator_options: GeneratorOptions,
    pub worker_options: WorkerOptions,
    pub shutdown_token: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub on_start: bool,
    pub clear_on_start: bool,
    pub schedule: Option<JobSchedule>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub job_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub feed_base_url: Url,
    pub metadata_base_url: Url,
    pub generator_options: GeneratorOptions,
    pub worker_options: WorkerOptions,
    pub otel_stdout: bool,
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, Error> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let schedule = match var("REGENERATE_SCHEDULE") {
            Some(s) => Some(s.parse::<JobSchedule>()?),
            None => None,
        };
        let config = Config {
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://shelfish.db".into()),
            feed_base_url: base_url(
                "FEED_BASE_URL",
                var("FEED_BASE_URL").as_deref().unwrap_or("http://127.0.0.1:8090/feeds/"),
            )?,
            metadata_base_url: base_url(
                "METADATA_BASE_URL",
                var("METADATA_BASE_URL").as_deref().unwrap_or("http://127.0.0.1:8091/"),
            )?,
            generator_options: GeneratorOptions {
                on_start: parse_flag("GENERATE_ON_START", var("GENERATE_ON_START"), true)?,
                clear_on_start: parse_flag("CLEAR_ON_START", var("CLEAR_ON_START"), true)?,
                schedule,
                retry: var("REGENERATE_FAILED")
                    .map(|s| s.parse::<RetryPolicy>())
                    .transpose()?
                    .unwrap_or_default(),
            },
            worker_options: WorkerOptions {
                poll_interval: Duration::from_millis(parse_or(
                    "POLL_INTERVAL_MS",
                    var("POLL_INTERVAL_MS"),
                    1000,
                )?),
                job_timeout: Duration::from_millis(parse_or(
                    "JOB_TIMEOUT_MS",
                    var("JOB_TIMEOUT_MS"),
                    30_000,
                )?),
            },
            otel_stdout: parse_flag("OTEL_STDOUT", var("OTEL_STDOUT"), false)?,
        };
        Ok(config)
    }
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<AppState>, Error> {
        let pool = db::connect(&config.database_url).await?;

        let client = fetch::http_client();
        let feeds = HttpFeedSource::new(client.clone(), config.feed_base_url);
        let metadata = HttpMetadataSource::new(client, config.metadata_base_url);
        let dispatcher = TaskDispatcher::new(pool.clone(), Arc::new(feeds), Arc::new(metadata));

        Ok(Self::from_parts(
            pool,
            dispatcher,
            config.generator_options,
            config.worker_options,
        ))
    }

    pub fn from_parts(
        pool: Pool<Sqlite>,
        dispatcher: TaskDispatcher,
        generator_options: GeneratorOptions,
        worker_options: WorkerOptions,
    ) -> Arc<AppState> {
        let hostname = whoami::hostname();
        let instance_id = format!("{}:{}", hostname, std::process::id());
        let state = AppState {
            instance_id,
            store: JobStore::new(pool.clone()),
            pool,
            dispatcher: Arc::new(dispatcher),
            generator_options,
            worker_options,
            shutdown_token: CancellationToken::new(),
        };
        Arc::new(state)
    }
}

fn base_url(key: &'static str, raw: &str) -> Result<Url, Error> {
    let mut raw = raw.trim().to_owned();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|_| Error::InvalidParams(key))
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, Error> {
    match value {
        Some(v) => v.trim().parse().map_err(|_| Error::InvalidParams(key)),
        None => Ok(default),
    }
}

fn parse_flag(key: &'static str, value: Option<String>, default: bool) -> Result<bool, Error> {
    match value.as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(Error::InvalidParams(key)),
    }
}

#[tokio::test]
async fn config_from_lookup_defaults() -> anyhow::Result<()> {
    // act
    let config = Config::from_lookup(|_| None)?;

    // assert
    assert_eq!("sqlite://shelfish.db", config.database_url);
    assert_eq!(Duration::from_secs(1), config.worker_options.poll_interval);
    assert_eq!(Duration::from_secs(30), config.worker_options.job_timeout);
    assert!(config.generator_options.on_start);
    assert!(config.generator_options.clear_on_start);
    assert!(config.generator_options.schedule.is_none());
    assert_eq!(RetryPolicy::Immediate, config.generator_options.retry);
    assert!(!config.otel_stdout);
    Ok(())
}

#[tokio::test]
async fn config_from_lookup_overrides() -> anyhow::Result<()> {
    // arrange
    let env = std::collections::HashMap::from([
        ("DATABASE_URL", "sqlite::memory:"),
        ("FEED_BASE_URL", "https://feeds.example.com/oku"),
        ("POLL_INTERVAL_MS", "250"),
        ("CLEAR_ON_START", "false"),
        ("REGENERATE_SCHEDULE", "3600"),
        ("REGENERATE_FAILED", "never"),
    ]);

    // act
    let config = Config::from_lookup(|key| env.get(key).map(|v| v.to_string()))?;

    // assert
    assert_eq!("sqlite::memory:", config.database_url);
    assert_eq!("https://feeds.example.com/oku/", config.feed_base_url.as_str());
    assert_eq!(Duration::from_millis(250), config.worker_options.poll_interval);
    assert!(!config.generator_options.clear_on_start);
    assert_eq!(
        Some(JobSchedule::Interval { interval: 3600 }),
        config.generator_options.schedule
    );
    assert_eq!(RetryPolicy::Never, config.generator_options.retry);
    Ok(())
}

#[tokio::test]
async fn config_from_lookup_err() -> anyhow::Result<()> {
    // act
    let res = Config::from_lookup(|key| (key == "JOB_TIMEOUT_MS").then(|| "soon".to_string()));

    // assert
    assert!(matches!(res, Err(Error::InvalidParams("JOB_TIMEOUT_MS"))));
    Ok(())
}
