/// PostgreSQL implementations of the workflow store and lock provider.
///
/// Provides [`PostgresStore`] and [`PostgresLockProvider`] backed by a shared
/// [`sqlx::PgPool`], plus [`apply_schema`] to create the tables they use.
pub mod postgres;

pub use postgres::{apply_schema, connect, PostgresLockProvider, PostgresStore, SCHEMA};
