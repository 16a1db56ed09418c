//! Stitch Server Library
//!
//! Resumable chunked uploads: chunks are verified and stored independently,
//! tracked in a session registry, merged into a single artifact once
//! complete, and reclaimed by a background sweeper when abandoned.
//!
//! # Modules
//!
//! - `upload`: blob store, checksums, session registry, merge engine, sweeper
//! - `routes`: axum HTTP surface
//! - `db`: SQLite pool and schema for the persistent registry

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
