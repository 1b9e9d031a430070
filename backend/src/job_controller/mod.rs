//! # Job controller
//!
//! Everything between "a user asked for an image" and "the job reached a
//! terminal state".
//!
//! ## Sub-modules:
//! - `state`: the progress tracker (per-job records, status state machine,
//!   write-through archive, the updater task).
//! - `submit`: validates, checks credits, reserves a place, hands the job to
//!   an engine and returns the job id without waiting for the work.
//! - `dispatch`: the per-job worker that polls the engine and reports
//!   progress, result or failure back to the tracker.
//! - `retention`: the background sweeper removing expired jobs and their
//!   artifacts.

pub mod dispatch;
pub mod retention;
pub mod state;
pub mod submit;
