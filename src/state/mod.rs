//! Transaction journal with PostgreSQL persistence
//!
//! Optional. Records every mutating call and its latest lifecycle state so
//! operators can look transactions up after the caller's ticket is gone.

mod journal;

pub use journal::{JournalEntry, TransactionJournal};
