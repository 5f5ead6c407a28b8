pub mod memory;
pub mod models;
pub mod mutation;
pub mod postgres;
pub mod repos;
pub mod store;

pub use memory::MemoryStore;
pub use mutation::{
    Aggregate, CommitResult, Entity, EventOutcome, Mutation, MutationOp, PurgeScope, Row, RowKey,
    WriteSet,
};
pub use postgres::PgStore;
pub use store::{AggregateStore, CursorStore, StoreError};

pub use sqlx::Pool;
pub use sqlx::Postgres;
pub use sqlx::postgres::PgPool;

use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connect to PostgreSQL with a production-ready connection pool.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
}

/// Apply the bundled schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
