//! Provenance: content digests, run event log, revision lookup.

pub mod eventlog;
pub mod hasher;
pub mod revision;
