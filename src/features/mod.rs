pub mod feeds;
pub mod fetch;
pub mod metadata;
pub mod schedules;
