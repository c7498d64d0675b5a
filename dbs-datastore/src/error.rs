use std::io;

use thiserror::Error;

use crate::file_formats::RecordKey;

/// Errors surfaced by the volume store.
///
/// Peer death on the work channel is deliberately *not* represented
/// here: the channel reports it through its return values, as normal
/// termination rather than a failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A syscall failed, or transferred a short count.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The sidecar bytes were rejected by the parser.
    #[error("corrupt volume config: {0}")]
    Corrupt(&'static str),

    /// The sidecar was written by a binary with different header sizes.
    #[error("incompatible on-disk layout: {field} is {found}, expected {expected}")]
    IncompatibleLayout {
        field: &'static str,
        found: u32,
        expected: u32,
    },

    /// Two unfinished rows share a record key.
    #[error("duplicate unfinished record {0}")]
    DuplicateKey(RecordKey),

    /// An argument violated a documented bound.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
