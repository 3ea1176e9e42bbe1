xflags::xflags! {
    /// Book catalogue job queue: generates enrichment jobs and runs them one at a time.
    cmd shelfq {
        /// SQLite database url, overrides DATABASE_URL.
        optional --database-url database_url: String
        /// Skip job generation at startup.
        optional --no-generate
        /// Generate at startup without clearing queued jobs first.
        optional --keep-backlog
        /// Run queued jobs until none is pending, then exit.
        optional --drain
        /// Print every job as a JSON line and exit.
        optional --list
    }
}
