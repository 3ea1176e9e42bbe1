pub use error::Error;
pub use job::FeedCategory;
pub use job::FeedSyncPayload;
pub use job::JobKind;
pub use job::JobPayload;
pub use job::JobRecord;
pub use job::JobRow;
pub use job::JobStatus;
pub use job::MetadataScrapePayload;
pub use jobretry::RetryPolicy;
pub use state::AppState;
pub use state::Config;
pub use state::GeneratorOptions;
pub use state::WorkerOptions;

pub(crate) use job::{from_micros, now_micros};

mod error;
mod job;
mod jobretry;
mod state;
