//! # poolsched
//!
//! Fair-share scheduler for per-user intentions.
//!
//! Workers pull ready intentions out of a shared backlog, pick users
//! uniformly among those with ready work, claim batches as jobs together
//! with the users' rate-limited tokens, run them through per-kind handlers,
//! and archive the outcome.

pub mod backlog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod sched;
pub mod telemetry;
