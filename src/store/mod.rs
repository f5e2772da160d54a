//! Persistence layer — libSQL-backed storage for tasks and workers.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::TaskStore;
