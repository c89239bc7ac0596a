//! Test helpers for crates built on `requery`.
//!
//! Depending on this crate turns on `requery`'s `test` feature, which
//! switches its clock to `tokio::time` (so tests can pause and advance it)
//! and exposes the shared helpers re-exported here. See [`requery::test`]
//! for the individual items.

pub use requery::test::*;
