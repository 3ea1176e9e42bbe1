use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use url::Url;

use super::fetch::{self, HttpClient};
use crate::models::{Error, FeedCategory};

/// A book as published by the reading-status feed. `guid` is the feed's
/// stable identifier and maps to `book.oku_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub guid: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pub_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEvent {
    pub event_type: String,
    pub book_guid: String,
    pub event_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedPull {
    #[serde(default)]
    pub books: Vec<BookRecord>,
    #[serde(default)]
    pub events: Vec<BookEvent>,
}

#[async_trait]
pub trait FeedSource: Debug + Send + Sync {
    async fn fetch_feed(&self, category: FeedCategory) -> Result<FeedPull, Error>;
}

#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: HttpClient,
    base_url: Url,
}

impl HttpFeedSource {
    pub fn new(client: HttpClient, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn feed_url(&self, category: FeedCategory) -> Result<Url, Error> {
        self.base_url
            .join(category.as_str())
            .map_err(|_| Error::InvalidUrl)
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feed(&self, category: FeedCategory) -> Result<FeedPull, Error> {
        let url = self.feed_url(category)?;
        fetch::get_json(&self.client, &url).await
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct StubFeedSource {
    pub pull: Option<FeedPull>,
    pub calls: std::sync::Mutex<Vec<FeedCategory>>,
}

#[cfg(test)]
impl StubFeedSource {
    pub fn calls(&self) -> Vec<FeedCategory> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl FeedSource for StubFeedSource {
    async fn fetch_feed(&self, category: FeedCategory) -> Result<FeedPull, Error> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(category);
        }
        self.pull
            .clone()
            .ok_or_else(|| Error::Fetch("feed unavailable".into()))
    }
}

#[tokio::test]
async fn feed_url_per_category() -> anyhow::Result<()> {
    // arrange
    let base = Url::parse("https://feeds.example.com/oku/")?;
    let source = HttpFeedSource::new(fetch::http_client(), base);

    // act
    let urls = FeedCategory::ALL
        .iter()
        .map(|c| source.feed_url(*c).map(|u| u.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    // assert
    assert_eq!(
        vec![
            "https://feeds.example.com/oku/read",
            "https://feeds.example.com/oku/not-read",
            "https://feeds.example.com/oku/reading",
        ],
        urls
    );
    Ok(())
}

#[tokio::test]
async fn feed_pull_deserialize() -> anyhow::Result<()> {
    // arrange
    let raw = r#"{
        "books": [{"guid": "oku-1", "title": "Heartburn", "pub_date": "1983-01-01T00:00:00Z"}],
        "events": [{"event_type": "read", "book_guid": "oku-1", "event_date": "2024-02-03"}]
    }"#;

    // act
    let pull: FeedPull = serde_json::from_str(raw)?;

    // assert
    assert_eq!(1, pull.books.len());
    assert_eq!(None, pull.books[0].author);
    assert!(pull.books[0].pub_date.is_some());
    assert_eq!(NaiveDate::from_ymd_opt(2024, 2, 3), Some(pull.events[0].event_date));
    Ok(())
}
