//! # storage-adapters
//!
//! Implementations of the persistence ports (in-memory and, behind `db-postgres`, Postgres) and
//! local stand-ins for the external services.

pub mod external;
pub mod memory;
#[cfg(feature = "db-postgres")]
pub mod postgres;

pub use external::{
    LogMailer, NoopGeoLocator, NoopLanguageDetector, NoopSpamChecker, NoopTranslator, OutboxMailer,
};
pub use memory::MemoryStore;
#[cfg(feature = "db-postgres")]
pub use postgres::PgStore;
