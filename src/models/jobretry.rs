use super::Error;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Decides when a book whose last enrichment job failed may be queued again by
/// derived generation. A failed job record itself is never re-run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "retry")]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Failed jobs do not block the next generation pass.
    #[default]
    Immediate,
    /// A failed job blocks regeneration until its backlog is cleared.
    Never,
    /// A failed job blocks regeneration for `retry_delay` seconds.
    After { retry_delay: u32 },
}

impl RetryPolicy {
    /// Failed jobs updated strictly after the returned cutoff (micros) still
    /// block regeneration of their target.
    pub fn failed_cutoff(self, now_micros: i64) -> i64 {
        match self {
            RetryPolicy::Immediate => i64::MAX,
            RetryPolicy::Never => i64::MIN,
            RetryPolicy::After { retry_delay } => {
                now_micros.saturating_sub(i64::from(retry_delay) * 1_000_000)
            }
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "immediate" => Ok(RetryPolicy::Immediate),
            "never" => Ok(RetryPolicy::Never),
            secs => {
                let retry_delay: u32 = secs
                    .parse()
                    .map_err(|_| Error::InvalidParams("REGENERATE_FAILED"))?;
                Ok(RetryPolicy::After { retry_delay })
            }
        }
    }
}

impl Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Immediate => f.write_str("immediate"),
            RetryPolicy::Never => f.write_str("never"),
            RetryPolicy::After { retry_delay } => write!(f, "{}", retry_delay),
        }
    }
}

#[tokio::test]
async fn retry_policy_from_str_err() -> anyhow::Result<()> {
    // arrange
    let s = "sometimes";
    // act
    let policy: Result<RetryPolicy, _> = s.parse();

    // assert
    assert!(policy.is_err());
    Ok(())
}

#[tokio::test]
async fn retry_policy_from_str_empty() -> anyhow::Result<()> {
    // act
    let policy: RetryPolicy = "".parse()?;

    // assert
    assert_eq!(RetryPolicy::Immediate, policy);
    Ok(())
}

#[tokio::test]
async fn retry_policy_from_str_after() -> anyhow::Result<()> {
    // arrange
    let s = "3600";
    // act
    let policy: RetryPolicy = s.parse()?;

    // assert
    assert_eq!(RetryPolicy::After { retry_delay: 3600 }, policy);
    assert_eq!(s, policy.to_string());
    assert_eq!(RetryPolicy::Never, "never".parse::<RetryPolicy>()?);
    Ok(())
}

#[tokio::test]
async fn retry_policy_failed_cutoff() -> anyhow::Result<()> {
    // arrange
    let now = 10_000_000;

    // act & assert
    assert_eq!(i64::MAX, RetryPolicy::Immediate.failed_cutoff(now));
    assert_eq!(i64::MIN, RetryPolicy::Never.failed_cutoff(now));
    assert_eq!(
        7_000_000,
        RetryPolicy::After { retry_delay: 3 }.failed_cutoff(now)
    );
    Ok(())
}
