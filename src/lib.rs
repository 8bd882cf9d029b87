//! Kiln — cross-platform tool installer.
//!
//! Recipes become immutable, checksummed installation plans; plans execute
//! deterministically and refuse artifacts that changed upstream.

pub mod actions;
pub mod cli;
pub mod core;
pub mod fetch;
pub mod providers;
pub mod transport;
pub mod tripwire;

#[cfg(test)]
pub(crate) mod testkit;
