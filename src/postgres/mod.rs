// ABOUTME: PostgreSQL adapter for the DatabaseAdmin interface
// ABOUTME: Exposes connection setup and the tokio-postgres backed admin session

pub mod admin;
pub mod connection;

pub use admin::PgAdmin;
pub use connection::{connect, ConnectOptions};
