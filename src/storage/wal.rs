//! Write-Ahead Logging (WAL) module.
//!
//! This module implements the write-ahead log protecting every page change:
//! - Binary record framing with per-record checksums
//! - Segment files with rollover and torn-tail repair on open
//! - LSN assignment, flush policies and read-back for recovery
//! - Cut-till limits guarding truncation

pub mod manager;
pub mod record;
pub mod segment;

pub use manager::{WalConfig, WalIterator, WriteAheadLog};
pub use record::{Lsn, UnitId, WalRecord};
