//! # VeilDB Core
//!
//! Durable log layer for the VeilDB storage engine.
//!
//! This crate provides:
//! - A write-ahead log (WAL) holding small entries until the memtable is
//!   flushed into sorted tables
//! - A value log holding large values, addressed by `(fid, offset, len)`
//!   pointers stored in the LSM
//! - A key registry persisting rotating data keys for at-rest encryption
//! - Crash recovery that replays both log families in lockstep and truncates
//!   torn suffixes
//!
//! The LSM layer itself (memtable, sorted tables, commit oracle, garbage
//! collection) lives outside this crate and interacts with it through the
//! replay callback, value pointers, and the value-size routing threshold.

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod logfile;
pub mod manager;
pub mod registry;
mod replay;

pub use config::{Config, LoadingMode};
pub use entry::{key_with_ts, parse_ts, Entry, Request, ValuePointer};
pub use error::{Error, Result};
pub use logfile::LogFile;
pub use manager::LogManager;
pub use registry::{DataKey, KeyRegistry};
