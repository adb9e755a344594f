//! Scheduling core: readiness, fair user selection, batching, job building.
//!
//! One [`Scheduler`] belongs to one worker. Its methods are spread over the
//! submodules, each adding one step of the pipeline:
//!
//! `select_ready_users` → `collect_intentions` → `new_job`
//!
//! composed by [`Scheduler::get_new_job`].

pub mod batcher;
pub mod builder;
pub mod readiness;
pub mod selector;

use crate::backlog::Backlog;
use crate::model::{IntentionKind, WorkerId};
use rand::SeedableRng;
use rand::rngs::StdRng;
use readiness::ReadinessRule;
use std::sync::Arc;

/// The kind a scheduling step is restricted to, with its readiness rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindScope {
    pub kind: IntentionKind,
    pub rule: ReadinessRule,
}

impl KindScope {
    pub fn new(kind: impl Into<IntentionKind>, rule: ReadinessRule) -> Self {
        Self {
            kind: kind.into(),
            rule,
        }
    }
}

/// Builds jobs for one worker out of the shared backlog.
pub struct Scheduler {
    backlog: Arc<dyn Backlog>,
    worker_id: WorkerId,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(backlog: Arc<dyn Backlog>, worker_id: WorkerId) -> Self {
        Self {
            backlog,
            worker_id,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the sampling RNG (seeded RNGs make selection reproducible).
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn backlog(&self) -> &Arc<dyn Backlog> {
        &self.backlog
    }
}
