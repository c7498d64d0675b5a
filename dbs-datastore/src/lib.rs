//! This module implements the volume storage layer of the backup
//! daemon.
//!
//! # Data formats
//!
//! A volume is a directory holding three cooperating file families plus
//! one small sidecar:
//!
//! * the *block file*, a flat array of [BlockHeader]s, one per backup
//!   session block,
//! * the *record file*, a flat array of [RecordHeader]s, each pointing
//!   at a payload region inside a data file,
//! * one or more *data files* carrying raw payload bytes, append-only,
//! * the *sidecar*, which enumerates all of the above and the table of
//!   records whose payload has not fully arrived yet.
//!
//! Block and record files are accessed through [FileVec], a typed
//! vector persisted one-to-one with a file. The sidecar is rewritten
//! last on every flush, so after a crash the other files are always at
//! least as new as what the sidecar describes, and a reopened volume
//! can resume every unfinished record exactly where it stopped.
//!
//! [BlockHeader]: file_formats::BlockHeader
//! [RecordHeader]: file_formats::RecordHeader
//! [FileVec]: file_vec::FileVec

pub mod config;
pub mod error;
pub mod file_formats;
pub mod file_vec;
pub mod volume;

pub use error::StoreError;
pub use file_vec::FileVec;
pub use volume::{Volume, WriteLoc};
