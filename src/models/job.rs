use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use super::Error;

/// Lifecycle of a queued job. Status only moves forward:
/// `pending -> running -> completed | failed`.
///
/// A claimed job is marked `running` before its payload is decoded, so a job
/// with a malformed payload still passes through `running` on its way to
/// `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Closed set of job tags understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    FeedSync,
    MetadataScrape,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobKind::FeedSync => "feed_sync",
            JobKind::MetadataScrape => "metadata_scrape",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feed_sync" => Ok(JobKind::FeedSync),
            "metadata_scrape" => Ok(JobKind::MetadataScrape),
            _ => Err(Error::UnknownJobType(s.to_owned())),
        }
    }
}

/// Reading-status collections a feed can be synchronized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedCategory {
    Read,
    NotRead,
    Reading,
}

impl FeedCategory {
    pub const ALL: [FeedCategory; 3] = [FeedCategory::Read, FeedCategory::NotRead, FeedCategory::Reading];

    pub const fn as_str(self) -> &'static str {
        match self {
            FeedCategory::Read => "read",
            FeedCategory::NotRead => "not-read",
            FeedCategory::Reading => "reading",
        }
    }
}

impl Display for FeedCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSyncPayload {
    pub feed_name: FeedCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataScrapePayload {
    #[serde(rename = "bookId")]
    pub book_id: i64,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
}

/// Decoded job payload; the variant decides the handler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    FeedSync(FeedSyncPayload),
    MetadataScrape(MetadataScrapePayload),
}

impl JobPayload {
    pub const fn kind(&self) -> JobKind {
        match self {
            JobPayload::FeedSync(_) => JobKind::FeedSync,
            JobPayload::MetadataScrape(_) => JobKind::MetadataScrape,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        let json = match self {
            JobPayload::FeedSync(p) => serde_json::to_string(p)?,
            JobPayload::MetadataScrape(p) => serde_json::to_string(p)?,
        };
        Ok(json)
    }

    /// Decodes a stored payload according to its job tag.
    pub fn decode(job_type: &str, payload: &str) -> Result<JobPayload, Error> {
        let kind: JobKind = job_type.parse()?;
        let decoded = match kind {
            JobKind::FeedSync => serde_json::from_str(payload).map(JobPayload::FeedSync),
            JobKind::MetadataScrape => serde_json::from_str(payload).map(JobPayload::MetadataScrape),
        };
        decoded.map_err(|source| Error::PayloadDecode {
            job_type: job_type.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub job_type: String,
    pub job_status: JobStatus,
    pub payload: String,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            id: row.id,
            job_type: row.job_type,
            status: row.job_status,
            payload: row.payload,
            created_at: from_micros(row.created_at),
            updated_at: row.updated_at.map(from_micros),
            message: row.message,
        }
    }
}

// Valid JSON is emitted inline, anything else as a plain string.
fn serialize_payload<S: Serializer>(payload: &str, serializer: S) -> Result<S::Ok, S::Error> {
    match serde_json::from_str::<&RawValue>(payload) {
        Ok(raw) => raw.serialize(serializer),
        Err(_) => serializer.serialize_str(payload),
    }
}

pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

#[tokio::test]
async fn job_payload_decode_metadata_scrape() -> anyhow::Result<()> {
    // arrange
    let raw = r#"{"bookId":7,"title":"X","author":"Y"}"#;

    // act
    let payload = JobPayload::decode("metadata_scrape", raw)?;

    // assert
    assert_eq!(
        JobPayload::MetadataScrape(MetadataScrapePayload {
            book_id: 7,
            title: "X".into(),
            author: "Y".into(),
            isbn: None,
        }),
        payload
    );
    assert_eq!(raw, payload.to_json()?);
    Ok(())
}

#[tokio::test]
async fn job_payload_decode_feed_sync() -> anyhow::Result<()> {
    // arrange
    let raw = r#"{"feed_name":"not-read"}"#;

    // act
    let payload = JobPayload::decode("feed_sync", raw)?;

    // assert
    assert_eq!(
        JobPayload::FeedSync(FeedSyncPayload {
            feed_name: FeedCategory::NotRead
        }),
        payload
    );
    assert_eq!(JobKind::FeedSync, payload.kind());
    Ok(())
}

#[tokio::test]
async fn job_payload_decode_err() -> anyhow::Result<()> {
    // act
    let unknown = JobPayload::decode("goodreads_scrape", "{}");
    let malformed = JobPayload::decode("metadata_scrape", r#"{"bookId":"seven"}"#);
    let bad_feed = JobPayload::decode("feed_sync", r#"{"feed_name":"wishlist"}"#);

    // assert
    assert!(matches!(unknown, Err(Error::UnknownJobType(t)) if t == "goodreads_scrape"));
    assert!(matches!(malformed, Err(Error::PayloadDecode { .. })));
    assert!(matches!(bad_feed, Err(Error::PayloadDecode { .. })));
    Ok(())
}

#[tokio::test]
async fn job_record_serialize_payload_inline() -> anyhow::Result<()> {
    // arrange
    let mut record = JobRecord {
        id: 1,
        job_type: "feed_sync".into(),
        status: JobStatus::Pending,
        payload: r#"{"feed_name":"read"}"#.into(),
        created_at: from_micros(0),
        updated_at: None,
        message: None,
    };

    // act
    let valid = serde_json::to_value(&record)?;
    record.payload = "not json".into();
    let invalid = serde_json::to_value(&record)?;

    // assert
    assert_eq!("read", valid["payload"]["feed_name"]);
    assert_eq!("pending", valid["status"]);
    assert_eq!("not json", invalid["payload"]);
    Ok(())
}
