//! pkgsmith: recipe-driven software packaging.
//!
//! Recipes are YAML documents that chain to parents. A resolved chain runs
//! as a pipeline of processors over a shared environment. Steps that need
//! root (building a package with preserved ownership, copying items onto a
//! volume) are delegated to small services listening on Unix sockets.

pub mod cli;
pub mod core;
pub mod daemon;
pub mod processors;
pub mod provenance;
pub mod transport;
