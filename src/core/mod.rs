//! Core recipe logic: types, parsing, indexing, resolution, trust, execution.

pub mod executor;
pub mod index;
pub mod parser;
pub mod prefs;
pub mod report;
pub mod resolver;
pub mod substitute;
pub mod trust;
pub mod types;
