//! Durable mail storage.
//!
//! The store is owned by the persistence worker. Every public operation
//! runs in its own transaction.

pub mod migrations;
mod repository;
pub mod threading;

pub use migrations::{MIGRATOR, migrate};
pub use repository::{MailStore, ReconcileSummary};
pub use threading::ThreadCounter;
