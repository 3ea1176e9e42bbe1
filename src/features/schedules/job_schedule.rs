use std::{fmt::Display, str::FromStr};

use crate::models::Error;
use chrono::{TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

/// When the generator service re-runs job generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[serde(rename_all = "snake_case")]
pub enum JobSchedule {
    /// Interval in seconds
    Interval { interval: u32 },
    /// Cron string
    Cron { cron: String },
}

impl JobSchedule {
    pub fn now_secs() -> i64 {
        Utc::now().timestamp()
    }

    /// Next fire time strictly after `after_unix_sec`. Intervals are aligned
    /// to multiples of the interval since the epoch.
    pub fn next(&self, after_unix_sec: i64) -> Option<i64> {
        match &self {
            JobSchedule::Interval { interval: 0 } => None,
            JobSchedule::Interval { interval } => {
                let interval = i64::from(*interval);
                Some(after_unix_sec - after_unix_sec.rem_euclid(interval) + interval)
            }
            JobSchedule::Cron { cron } => {
                let dt = Utc.timestamp_opt(after_unix_sec, 0).single()?;
                Schedule::from_str(cron)
                    .ok()?
                    .after(&dt)
                    .map(|dt| dt.timestamp())
                    .next()
            }
        }
    }
}

impl FromStr for JobSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidParams("REGENERATE_SCHEDULE"));
        }
        if let Ok(interval) = s.parse::<u32>() {
            if interval == 0 {
                return Err(Error::InvalidParams("REGENERATE_SCHEDULE"));
            }
            return Ok(JobSchedule::Interval { interval });
        }
        let mut parts: Vec<&str> = s.split(['|', ' ']).filter(|p| !p.is_empty()).collect();
        let fixed: String = match parts.len() {
            5 => {
                parts.insert(0, "0");
                Ok(parts.join(" "))
            }
            6 | 7 => Ok(parts.join(" ")),
            _ => Err(Error::InvalidParams("REGENERATE_SCHEDULE")),
        }?;
        let schedule =
            Schedule::from_str(&fixed).map_err(|_| Error::InvalidParams("REGENERATE_SCHEDULE"))?;
        Ok(JobSchedule::Cron {
            cron: schedule.to_string(),
        })
    }
}

impl Display for JobSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            JobSchedule::Interval { interval } => write!(f, "{}", interval),
            JobSchedule::Cron { cron } => write!(f, "{}", cron),
        }
    }
}

#[tokio::test]
async fn schedule_from_str_err() -> anyhow::Result<()> {
    // act
    let empty: Result<JobSchedule, _> = "".parse();
    let zero: Result<JobSchedule, _> = "0".parse();
    let garbage: Result<JobSchedule, _> = "every day".parse();

    // assert
    assert!(empty.is_err());
    assert!(zero.is_err());
    assert!(garbage.is_err());
    Ok(())
}

#[tokio::test]
async fn schedule_from_str_interval() -> anyhow::Result<()> {
    // arrange
    let s = "300";

    // act
    let schedule: JobSchedule = s.parse()?;

    // assert
    assert_eq!(JobSchedule::Interval { interval: 300 }, schedule);
    assert_eq!(s, schedule.to_string());
    Ok(())
}

#[tokio::test]
async fn schedule_interval_next() -> anyhow::Result<()> {
    // arrange
    let now_secs = JobSchedule::now_secs();
    let now_sec_to_5_min: i64 = now_secs - (now_secs % 300);

    // act
    let schedule: JobSchedule = "300".parse()?;
    let next = schedule.next(now_secs);
    let on_boundary = schedule.next(now_sec_to_5_min);

    // assert
    assert_eq!(Some(now_sec_to_5_min + 300), next);
    assert_eq!(Some(now_sec_to_5_min + 300), on_boundary);
    Ok(())
}

#[tokio::test]
async fn schedule_from_str_cron() -> anyhow::Result<()> {
    // arrange
    let s = "*/5 * * * *";

    // act
    let schedule: JobSchedule = s.parse()?;

    // assert
    assert_eq!(
        JobSchedule::Cron {
            cron: "0 */5 * * * *".into()
        },
        schedule
    );
    assert_eq!("0 */5 * * * *", schedule.to_string());
    Ok(())
}

#[tokio::test]
async fn schedule_cron_next() -> anyhow::Result<()> {
    // arrange
    let now_secs = JobSchedule::now_secs();
    let now_sec_to_5_min: i64 = now_secs - (now_secs % 300);

    // act
    let schedule: JobSchedule = "*/5 * * * *".parse()?;
    let next = schedule.next(now_secs);

    // assert
    assert_eq!(Some(now_sec_to_5_min + 300), next);
    Ok(())
}
