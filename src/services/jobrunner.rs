use sqlx::{Pool, Sqlite};
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, info, warn};

use crate::{
    db,
    features::{feeds::FeedSource, metadata::MetadataSource},
    models::{now_micros, Error, FeedSyncPayload, JobPayload, MetadataScrapePayload},
};

/// Routes a decoded payload to the collaborator doing the work and persists
/// the result.
#[derive(Debug)]
pub struct TaskDispatcher {
    pool: Pool<Sqlite>,
    feeds: Arc<dyn FeedSource>,
    metadata: Arc<dyn MetadataSource>,
}

impl TaskDispatcher {
    pub fn new(
        pool: Pool<Sqlite>,
        feeds: Arc<dyn FeedSource>,
        metadata: Arc<dyn MetadataSource>,
    ) -> Self {
        Self {
            pool,
            feeds,
            metadata,
        }
    }

    pub async fn dispatch(&self, payload: &JobPayload) -> Result<(), Error> {
        match payload {
            JobPayload::FeedSync(p) => self.feed_sync(p).await,
            JobPayload::MetadataScrape(p) => self.metadata_scrape(p).await,
        }
    }

    async fn feed_sync(&self, payload: &FeedSyncPayload) -> Result<(), Error> {
        let feed_name = payload.feed_name.as_str();
        let pull = self.feeds.fetch_feed(payload.feed_name).await?;
        let now = now_micros();

        let mut tx = self.pool.begin().await?;
        let mut books = 0;
        for book in &pull.books {
            books += db::books::upsert_ignore_book(&mut *tx, book, now).await?;
        }
        let mut events = 0;
        for event in &pull.events {
            let inserted = db::books::upsert_ignore_event(&mut *tx, event).await?;
            if inserted == 0 {
                debug!({ feed_name, book_guid = event.book_guid.as_str() }, "event skipped");
            }
            events += inserted;
        }
        tx.commit().await?;

        info!(
            { feed_name, books, events, received_books = pull.books.len(), received_events = pull.events.len() },
            "feed synced"
        );
        Ok(())
    }

    async fn metadata_scrape(&self, payload: &MetadataScrapePayload) -> Result<(), Error> {
        let book_id = payload.book_id;
        let metadata = match payload.isbn.as_deref() {
            Some(isbn) => self.metadata.fetch_by_isbn(isbn).await?,
            None => {
                self.metadata
                    .fetch_by_title_author(&payload.title, &payload.author)
                    .await?
            }
        };
        let isbn = metadata
            .isbn
            .clone()
            .or_else(|| payload.isbn.clone())
            .ok_or_else(|| Error::Fetch(format!("no ISBN found for book {book_id}")))?;
        let json = serde_json::to_string(&metadata)?;
        let now = now_micros();

        let mut tx = self.pool.begin().await?;
        db::books::upsert_metadata_cache(&mut *tx, &isbn, &json, now).await?;
        let updated = db::books::update_metadata(&mut *tx, book_id, &metadata, now).await?;
        if updated == 0 {
            return Err(Error::BookNotFound(book_id));
        }
        tx.commit().await?;

        info!({ book_id, isbn = isbn.as_str() }, "metadata updated");
        Ok(())
    }
}

#[cfg(test)]
use crate::{
    features::{
        feeds::{BookEvent, BookRecord, FeedPull, StubFeedSource},
        metadata::{BookMetadata, StubMetadataSource},
    },
    models::FeedCategory,
};

#[cfg(test)]
fn feed_book(guid: &str, title: &str) -> BookRecord {
    BookRecord {
        guid: guid.into(),
        title: title.into(),
        author: Some("Anon".into()),
        image_url: None,
        description: None,
        pub_date: None,
        update_date: None,
    }
}

#[cfg(test)]
fn scrape_payload(book_id: i64, isbn: Option<&str>) -> JobPayload {
    JobPayload::MetadataScrape(MetadataScrapePayload {
        book_id,
        title: "X".into(),
        author: "Y".into(),
        isbn: isbn.map(str::to_owned),
    })
}

#[cfg(test)]
async fn count(pool: &Pool<Sqlite>, table: &str) -> anyhow::Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    Ok(sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await?)
}

#[tokio::test]
async fn dispatch_feed_sync_idempotent() -> anyhow::Result<()> {
    // arrange
    let pool = db::test_pool().await?;
    let event_date = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap_or_default();
    let feeds = Arc::new(StubFeedSource {
        pull: Some(FeedPull {
            books: vec![
                feed_book("oku-1", "Heartburn"),
                feed_book("oku-2", "Piranesi"),
                feed_book("oku-3", "Kindred"),
            ],
            events: vec![
                BookEvent {
                    event_type: "read".into(),
                    book_guid: "oku-1".into(),
                    event_date,
                },
                BookEvent {
                    event_type: "read".into(),
                    book_guid: "oku-3".into(),
                    event_date,
                },
            ],
        }),
        ..Default::default()
    });
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        feeds.clone(),
        Arc::new(StubMetadataSource::default()),
    );
    let payload = JobPayload::decode("feed_sync", r#"{"feed_name":"read"}"#)?;

    // act
    dispatcher.dispatch(&payload).await?;
    let after_first = (count(&pool, "book").await?, count(&pool, "book_event").await?);
    dispatcher.dispatch(&payload).await?;
    let after_second = (count(&pool, "book").await?, count(&pool, "book_event").await?);

    // assert
    assert_eq!(vec![FeedCategory::Read, FeedCategory::Read], feeds.calls());
    assert_eq!((3, 2), after_first);
    assert_eq!((3, 2), after_second);
    Ok(())
}

#[tokio::test]
async fn dispatch_feed_sync_fetch_error() -> anyhow::Result<()> {
    // arrange
    let pool = db::test_pool().await?;
    let feeds = Arc::new(StubFeedSource::default());
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        feeds.clone(),
        Arc::new(StubMetadataSource::default()),
    );
    let payload = JobPayload::decode("feed_sync", r#"{"feed_name":"reading"}"#)?;

    // act
    let res = dispatcher.dispatch(&payload).await;

    // assert
    assert!(matches!(res, Err(Error::Fetch(_))));
    assert_eq!(vec![FeedCategory::Reading], feeds.calls());
    assert_eq!(0, count(&pool, "book").await?);
    Ok(())
}

#[tokio::test]
async fn dispatch_metadata_scrape_fetch_error_leaves_book() -> anyhow::Result<()> {
    // arrange
    let pool = db::test_pool().await?;
    let book_id = db::books::insert_plain(&pool, "X", "Y", None).await?;
    let before = db::books::get_by_id(&pool, book_id).await?;
    let metadata = Arc::new(StubMetadataSource::default());
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        metadata.clone(),
    );

    // act
    let res = dispatcher.dispatch(&scrape_payload(book_id, None)).await;

    // assert
    assert!(matches!(res, Err(Error::Fetch(_))));
    assert_eq!(vec!["title_author:X|Y".to_string()], metadata.calls());
    assert_eq!(before, db::books::get_by_id(&pool, book_id).await?);
    assert_eq!(0, count(&pool, "cache_book_metadata").await?);
    Ok(())
}

#[tokio::test]
async fn dispatch_metadata_scrape_updates_book() -> anyhow::Result<()> {
    // arrange
    let pool = db::test_pool().await?;
    let book_id = db::books::insert_plain(&pool, "X", "Y", None).await?;
    let metadata = Arc::new(StubMetadataSource {
        metadata: Some(BookMetadata {
            title: "X".into(),
            isbn: Some("0063045168".into()),
            description: Some("Essays on love".into()),
            ..Default::default()
        }),
        ..Default::default()
    });
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        metadata.clone(),
    );

    // act
    dispatcher.dispatch(&scrape_payload(book_id, None)).await?;

    // assert
    let book = db::books::get_by_id(&pool, book_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("book missing"))?;
    assert_eq!(Some("0063045168".to_string()), book.isbn);
    assert_eq!(Some("Essays on love".to_string()), book.description);
    assert_eq!(None, book.image_url);
    assert_eq!(1, count(&pool, "cache_book_metadata").await?);
    Ok(())
}

#[tokio::test]
async fn dispatch_metadata_scrape_by_isbn() -> anyhow::Result<()> {
    // arrange
    let pool = db::test_pool().await?;
    let book_id = db::books::insert_plain(&pool, "X", "Y", Some("9781250777355")).await?;
    let metadata = Arc::new(StubMetadataSource {
        metadata: Some(BookMetadata {
            title: "X".into(),
            image_url: Some("https://covers.example.com/x.jpg".into()),
            ..Default::default()
        }),
        ..Default::default()
    });
    let dispatcher = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        metadata.clone(),
    );

    // act
    dispatcher
        .dispatch(&scrape_payload(book_id, Some("9781250777355")))
        .await?;

    // assert
    assert_eq!(vec!["isbn:9781250777355".to_string()], metadata.calls());
    let book = db::books::get_by_id(&pool, book_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("book missing"))?;
    assert_eq!(Some("9781250777355".to_string()), book.isbn);
    assert_eq!(Some("https://covers.example.com/x.jpg".to_string()), book.image_url);
    Ok(())
}

#[tokio::test]
async fn dispatch_metadata_scrape_without_isbn_or_book() -> anyhow::Result<()> {
    // arrange
    let pool = db::test_pool().await?;
    let book_id = db::books::insert_plain(&pool, "X", "Y", None).await?;
    let no_isbn = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        Arc::new(StubMetadataSource {
            metadata: Some(BookMetadata {
                title: "X".into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    );
    let vanished = TaskDispatcher::new(
        pool.clone(),
        Arc::new(StubFeedSource::default()),
        Arc::new(StubMetadataSource {
            metadata: Some(BookMetadata {
                title: "X".into(),
                isbn: Some("0063045168".into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
    );

    // act
    let missing_isbn = no_isbn.dispatch(&scrape_payload(book_id, None)).await;
    let missing_book = vanished.dispatch(&scrape_payload(book_id + 1, None)).await;

    // assert
    assert!(matches!(missing_isbn, Err(Error::Fetch(_))));
    assert!(matches!(missing_book, Err(Error::BookNotFound(id)) if id == book_id + 1));
    assert_eq!(0, count(&pool, "cache_book_metadata").await?);
    Ok(())
}
