use tokio::time::error::Elapsed;

// region:    Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Job Not Found - {0}")]
    JobNotFound(i64),

    #[error(transparent)]
    DbError(#[from] sqlx::Error),

    #[error("Payload Decode Error - {job_type}: {source}")]
    PayloadDecode {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown Job Type - {0}")]
    UnknownJobType(String),

    #[error("Book Not Found - {0}")]
    BookNotFound(i64),

    #[error("Fetch Error - {0}")]
    Fetch(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Timeout(#[from] Elapsed),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    HttpError(#[from] hyper::http::Error),

    #[error(transparent)]
    HyperError(#[from] hyper::Error),

    #[error(transparent)]
    HyperClientError(#[from] hyper_util::client::legacy::Error),

    #[error("Invalid Url")]
    InvalidUrl,

    #[error("Invalid Params - {0}")]
    InvalidParams(&'static str),
}
// endregion: Error

impl Error {
    /// Store failures are fatal to the enclosing operation; everything else
    /// only terminates the job it happened in.
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Error::DbError(_) | Error::JobNotFound(_))
    }
}

#[tokio::test]
async fn error_is_persistence() -> anyhow::Result<()> {
    // arrange
    let not_found = Error::JobNotFound(1);
    let db = Error::DbError(sqlx::Error::RowNotFound);
    let unknown = Error::UnknownJobType("goodreads_scrape".into());
    let fetch = Error::Fetch("503".into());
    let book = Error::BookNotFound(7);

    // act & assert
    assert!(not_found.is_persistence());
    assert!(db.is_persistence());
    assert!(!unknown.is_persistence());
    assert!(!fetch.is_persistence());
    assert!(!book.is_persistence());
    Ok(())
}
