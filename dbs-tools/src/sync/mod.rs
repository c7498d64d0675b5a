//! Thread synchronisation helpers.

pub mod spsc;
