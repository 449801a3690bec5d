//! PostgreSQL Database Module
//!
//! Backs the batch scanner with the host application's accounts and a durable cursor.

pub mod accounts;
pub mod cursor;
pub mod pool;

pub use accounts::PgAccountRepository;
pub use cursor::PgCursorRepository;
pub use pool::DatabasePool;
