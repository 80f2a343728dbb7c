//! Integration test suite for gantry.
//!
//! These tests drive the step executor, convoy tracker and batch dispatcher
//! through the in-memory store, session, worker and notifier fakes, plus a
//! real git repository for the worktree-backed worker pool.
//!
//! # Test Categories
//!
//! - `step_executor`: group readiness, fan-out and fan-in
//! - `convoy_tracking`: completion, notification, reopen, stranded detection
//! - `batch_dispatch`: admission, rollback, dry run, pre-flight, formulas
//! - `git_workers`: dispatch onto git worktrees
//!
//! # CI Compatibility
//!
//! No test needs tmux, the `bd` CLI or network access.

mod fixtures;

mod batch_dispatch;
mod convoy_tracking;
