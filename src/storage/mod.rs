//! PostgreSQL-backed persistence: schema, migrations and the database
//! client implementing the queue, agent-state and end-product stores.

pub mod database;
pub mod migrations;
pub mod schema;

pub use database::{Database, DatabaseError};
pub use migrations::{MigrationError, MigrationRunner};
