//! Tripwire — content hashing and install provenance.

pub mod eventlog;
pub mod hasher;
