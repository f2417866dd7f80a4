use thiserror::Error;

/// Errors surfaced by the store implementations behind the
/// [`FastStore`](crate::store::FastStore) and
/// [`DurableStore`](crate::store::DurableStore) seams.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("failed to create connection pool: {0}")]
    PoolCreate(#[from] deadpool_postgres::CreatePoolError),

    #[error("store operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

// -----------------------------------------------------------------------------
// Service Errors (Standardized)
// -----------------------------------------------------------------------------

/// Errors returned by [`CounterService`](crate::service::CounterService)
/// operations.
///
/// Transient fast-store errors never appear here: the operation re-routes
/// through the durable store for its own completion and only a failure on
/// that path is surfaced, as [`TallyError::Durable`].
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("durable store error: {0}")]
    Durable(#[source] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
