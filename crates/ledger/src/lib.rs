//! Persistent ledger for the settlement pipeline.
//!
//! Every state change the pipeline makes lands here as a conditional
//! write: the row is only updated if it is still in the status the caller
//! observed, and the call reports whether it won. Two implementations are
//! provided: [`InMemoryLedger`] for tests and local runs, and
//! [`PostgresLedger`] for production.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{LedgerError, Result};
pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use store::{
    JobStore, LedgerStore, OrderStore, PaymentStore, SettingsStore, StockStore, WalletStore,
    WebhookStore,
};
