//! Core data models for the placement gateway.
//!
//! Buckets, object records and multipart records map to SQLite tables via
//! `sqlx::FromRow`; location settings are read from the placement config file.
//! All of them serialize naturally as JSON via `serde`.

pub mod bucket;
pub mod location;
pub mod multipart;
pub mod object;
