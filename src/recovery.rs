//! Recovery and crash resilience module.
//!
//! This module brings the page files back in line with the write-ahead log:
//! - Redo of fully bracketed atomic units after a crash
//! - Fuzzy checkpoints and the master record recovery starts from
//! - WAL truncation below the last checkpoint

pub mod checkpoint;
pub mod redo;

pub use checkpoint::{CheckpointManager, CheckpointStats, MasterRecord};
pub use redo::{Recovery, RecoveryStats};
