//! Core engine — recipes, versions, decomposition, dependencies, planning,
//! caching, and execution.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod executor;
pub mod installer;
pub mod parser;
pub mod planner;
pub mod platform;
pub mod recipe;
pub mod resolver;
pub mod state;
pub mod template;
pub mod types;
pub mod version;
