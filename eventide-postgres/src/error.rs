/// Error type for `PostgreSQL` backing log operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// An append returned no rows for the written events.
    #[error("database did not return the appended versions")]
    MissingReturnedVersion,
}
