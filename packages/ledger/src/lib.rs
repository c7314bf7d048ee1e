//! Per-queue job ledger with an atomic claim.

pub mod error;
pub mod local;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{LedgerError, Result};
pub use local::LocalLedger;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;
pub use traits::JobLedger;
