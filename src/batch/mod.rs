//! Concurrency primitives.
//!
//! Work is fanned out on the calling task (no spawning): `run` settles
//! everything concurrently, `run_chunked` bounds concurrency, `run_each`
//! serializes. Outcomes are collected into a [`BatchResult`] and only turned
//! into an error when the caller asks with [`BatchResult::raise_errors`],
//! either per batch or once after `combine`-ing several.

mod operation;
mod result;

pub use operation::BatchOperation;
pub use result::{BatchError, BatchResult};
