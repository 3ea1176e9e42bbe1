use crate::{
    features::{
        feeds::{BookEvent, BookRecord},
        metadata::BookMetadata,
    },
    models::Error,
};
use sqlx::{Executor, Sqlite};

/// Catalog rows eligible for metadata enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentPredicate {
    /// No ISBN yet; looked up by title and author.
    MissingIsbn,
    /// Has an ISBN but no description or cover; looked up by ISBN.
    MissingDetails,
}

impl EnrichmentPredicate {
    const fn condition(self) -> &'static str {
        match self {
            EnrichmentPredicate::MissingIsbn => "isbn IS NULL",
            EnrichmentPredicate::MissingDetails => {
                "isbn IS NOT NULL AND (description IS NULL OR image_url IS NULL)"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Candidate {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub isbn: Option<String>,
}

/// Candidates in random order, so a partially drained queue does not always
/// favour low book ids.
pub async fn query_candidates<'e, E>(
    executor: E,
    predicate: EnrichmentPredicate,
) -> Result<Vec<Candidate>, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT id, title, author, isbn FROM book WHERE {} ORDER BY RANDOM()",
        predicate.condition()
    );
    let rows = sqlx::query_as::<_, Candidate>(&sql)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

pub async fn upsert_ignore_book<'e, E>(executor: E, book: &BookRecord, now: i64) -> Result<u64, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    const SQL: &str = "INSERT OR IGNORE INTO book
        (title, author, image_url, description, oku_id, date_published, date_created, date_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)";
    let updated = book.update_date.map_or(now, |d| d.timestamp_micros());
    let res = sqlx::query(SQL)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.image_url)
        .bind(&book.description)
        .bind(&book.guid)
        .bind(book.pub_date.map(|d| d.timestamp_micros()))
        .bind(updated)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

/// Inserts the event for the book carrying `event.book_guid`; a missing book
/// or an already recorded event inserts nothing.
pub async fn upsert_ignore_event<'e, E>(executor: E, event: &BookEvent) -> Result<u64, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    const SQL: &str = "INSERT OR IGNORE INTO book_event (event_type, book_id, date_created)
        SELECT $1, id, $3 FROM book WHERE oku_id = $2";
    let res = sqlx::query(SQL)
        .bind(&event.event_type)
        .bind(&event.book_guid)
        .bind(event.event_date)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

/// Fills the book row from fetched metadata, keeping existing values where
/// the metadata has none.
pub async fn update_metadata<'e, E>(
    executor: E,
    book_id: i64,
    meta: &BookMetadata,
    now: i64,
) -> Result<u64, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    const SQL: &str = "UPDATE book SET
        image_url = COALESCE($2, image_url),
        description = COALESCE($3, description),
        isbn = COALESCE($4, isbn),
        isbn13 = COALESCE($5, isbn13),
        asin = COALESCE($6, asin),
        goodreads_id = COALESCE($7, goodreads_id),
        amazon_id = COALESCE($8, amazon_id),
        publisher = COALESCE($9, publisher),
        date_published = COALESCE($10, date_published),
        date_updated = $11
        WHERE id = $1";
    let res = sqlx::query(SQL)
        .bind(book_id)
        .bind(&meta.image_url)
        .bind(&meta.description)
        .bind(&meta.isbn)
        .bind(&meta.isbn13)
        .bind(&meta.asin)
        .bind(&meta.id)
        .bind(&meta.amazon_id)
        .bind(&meta.publisher)
        .bind(meta.date_published.map(|d| d.timestamp_micros()))
        .bind(now)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

pub async fn upsert_metadata_cache<'e, E>(
    executor: E,
    isbn: &str,
    json: &str,
    now: i64,
) -> Result<u64, Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    const SQL: &str = "INSERT INTO cache_book_metadata (isbn, json, date_updated) VALUES ($1, $2, $3)
        ON CONFLICT (isbn) DO UPDATE SET json = excluded.json, date_updated = excluded.date_updated";
    let res = sqlx::query(SQL)
        .bind(isbn)
        .bind(json)
        .bind(now)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct BookRow {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub isbn: Option<String>,
    pub oku_id: Option<String>,
    pub date_updated: i64,
}

#[cfg(test)]
pub async fn get_by_id(pool: &sqlx::Pool<Sqlite>, book_id: i64) -> Result<Option<BookRow>, Error> {
    const SQL: &str = "SELECT id, title, author, description, image_url, isbn, oku_id, date_updated
        FROM book WHERE id = $1";
    let row = sqlx::query_as::<_, BookRow>(SQL)
        .bind(book_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[cfg(test)]
pub async fn insert_plain(
    pool: &sqlx::Pool<Sqlite>,
    title: &str,
    author: &str,
    isbn: Option<&str>,
) -> Result<i64, Error> {
    const SQL: &str = "INSERT INTO book (title, author, isbn, date_created, date_updated)
        VALUES ($1, $2, $3, 0, 0) RETURNING id";
    let id = sqlx::query_scalar::<_, i64>(SQL)
        .bind(title)
        .bind(author)
        .bind(isbn)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

#[tokio::test]
async fn query_candidates_by_predicate() -> anyhow::Result<()> {
    // arrange
    let pool = crate::db::test_pool().await?;
    let no_isbn = insert_plain(&pool, "Like Love", "Michele Filgate", None).await?;
    let with_isbn = insert_plain(&pool, "Emotional Labor", "Rose Hackman", Some("9781250777355")).await?;

    // act
    let missing_isbn = query_candidates(&pool, EnrichmentPredicate::MissingIsbn).await?;
    let missing_details = query_candidates(&pool, EnrichmentPredicate::MissingDetails).await?;

    // assert
    assert_eq!(vec![no_isbn], missing_isbn.iter().map(|c| c.id).collect::<Vec<_>>());
    assert_eq!(vec![with_isbn], missing_details.iter().map(|c| c.id).collect::<Vec<_>>());
    assert_eq!(Some("9781250777355".to_string()), missing_details[0].isbn);
    Ok(())
}

#[tokio::test]
async fn upsert_ignore_event_needs_known_book() -> anyhow::Result<()> {
    // arrange
    let pool = crate::db::test_pool().await?;
    let book = BookRecord {
        guid: "oku-1".into(),
        title: "The Ottomans".into(),
        author: Some("Marc David Baer".into()),
        image_url: None,
        description: None,
        pub_date: None,
        update_date: None,
    };
    let event = BookEvent {
        event_type: "read".into(),
        book_guid: "oku-1".into(),
        event_date: chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
    };
    let orphan = BookEvent {
        book_guid: "oku-404".into(),
        ..event.clone()
    };

    // act
    let orphan_inserted = upsert_ignore_event(&pool, &orphan).await?;
    let book_inserted = upsert_ignore_book(&pool, &book, 1).await?;
    let book_again = upsert_ignore_book(&pool, &book, 2).await?;
    let event_inserted = upsert_ignore_event(&pool, &event).await?;
    let event_again = upsert_ignore_event(&pool, &event).await?;

    // assert
    assert_eq!(0, orphan_inserted);
    assert_eq!((1, 0), (book_inserted, book_again));
    assert_eq!((1, 0), (event_inserted, event_again));
    Ok(())
}
