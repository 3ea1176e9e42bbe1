use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use url::Url;

use super::fetch::{self, HttpClient};
use crate::models::Error;

/// Book details returned by the metadata provider. `id` is the provider's
/// own identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookMetadata {
    pub id: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub asin: Option<String>,
    pub amazon_id: Option<String>,
    pub publisher: Option<String>,
    pub date_published: Option<DateTime<Utc>>,
    pub genres: Vec<String>,
}

#[async_trait]
pub trait MetadataSource: Debug + Send + Sync {
    async fn fetch_by_title_author(&self, title: &str, author: &str) -> Result<BookMetadata, Error>;

    async fn fetch_by_isbn(&self, isbn: &str) -> Result<BookMetadata, Error>;
}

#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: HttpClient,
    base_url: Url,
}

impl HttpMetadataSource {
    pub fn new(client: HttpClient, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn search_url(&self, query: &str) -> Result<Url, Error> {
        let mut url = self.base_url.join("search").map_err(|_| Error::InvalidUrl)?;
        url.query_pairs_mut().append_pair("q", query);
        Ok(url)
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch_by_title_author(&self, title: &str, author: &str) -> Result<BookMetadata, Error> {
        let url = self.search_url(&title_author_query(title, author))?;
        fetch::get_json(&self.client, &url).await
    }

    async fn fetch_by_isbn(&self, isbn: &str) -> Result<BookMetadata, Error> {
        let url = self.search_url(isbn.trim())?;
        fetch::get_json(&self.client, &url).await
    }
}

fn title_author_query(title: &str, author: &str) -> String {
    format!("{} {}", title.trim(), author.trim()).to_lowercase()
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct StubMetadataSource {
    pub metadata: Option<BookMetadata>,
    pub delay: Option<std::time::Duration>,
    pub calls: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl StubMetadataSource {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn respond(&self, call: String) -> Result<BookMetadata, Error> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.metadata
            .clone()
            .ok_or_else(|| Error::Fetch("metadata unavailable".into()))
    }
}

#[cfg(test)]
#[async_trait]
impl MetadataSource for StubMetadataSource {
    async fn fetch_by_title_author(&self, title: &str, author: &str) -> Result<BookMetadata, Error> {
        self.respond(format!("title_author:{title}|{author}")).await
    }

    async fn fetch_by_isbn(&self, isbn: &str) -> Result<BookMetadata, Error> {
        self.respond(format!("isbn:{isbn}")).await
    }
}

#[tokio::test]
async fn search_url_lowercased_query() -> anyhow::Result<()> {
    // arrange
    let base = Url::parse("http://127.0.0.1:8091/")?;
    let source = HttpMetadataSource::new(fetch::http_client(), base);

    // act
    let by_title = source.search_url(&title_author_query(" Like Love", "Michele Filgate"))?;
    let by_isbn = source.search_url("9781250777355")?;

    // assert
    assert_eq!("http://127.0.0.1:8091/search?q=like+love+michele+filgate", by_title.as_str());
    assert_eq!("http://127.0.0.1:8091/search?q=9781250777355", by_isbn.as_str());
    Ok(())
}

#[tokio::test]
async fn book_metadata_deserialize_partial() -> anyhow::Result<()> {
    // arrange
    let raw = r#"{"id":"52578297","title":"Like Love","isbn":"0063045168","genres":["Essays"]}"#;

    // act
    let meta: BookMetadata = serde_json::from_str(raw)?;

    // assert
    assert_eq!(Some("52578297".to_string()), meta.id);
    assert_eq!(Some("0063045168".to_string()), meta.isbn);
    assert_eq!(None, meta.description);
    assert_eq!(vec!["Essays".to_string()], meta.genres);
    Ok(())
}
