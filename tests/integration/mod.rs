//! Integration test suite for poolshift.
//!
//! These tests drive the public API against a real git config repository
//! (a bare remote plus a working clone in a temp dir) and an in-memory
//! cluster standing in for the accessor and exec boundaries.
//!
//! # Test Categories
//!
//! - `swap`: Pool swap protocol, rollback, roll-forward/back guards, promote, align
//! - `branches`: Subset branch lifecycle, dovetail, idempotent settings writes
//! - `status`: Status waits and the rollout queue
//! - `health`: Fleet probes and readiness filtering
//! - `scale`: Spin-down and spin-up of idle subsets
//!
//! # CI Compatibility
//!
//! Only the `git` binary is required. No cluster or network access is used.


mod branches;
mod scale;
mod status;
mod swap;
