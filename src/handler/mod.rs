//! Intention handlers and their registry.
//!
//! A handler supplies everything kind-specific: its readiness rule, the
//! `run` business logic, and any follow-up intentions spawned on success.
//! The registry maps each kind tag to exactly one handler; the priority
//! list from configuration is resolved against it once at startup.

pub mod command;

use crate::backlog::Backlog;
use crate::error::{Error, Result};
use crate::model::*;
use crate::sched::KindScope;
use crate::sched::readiness::ReadinessRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

pub use command::{CommandHandler, HandlerConfig};

#[async_trait]
pub trait IntentionHandler: Send + Sync {
    /// The kind tag this handler serves.
    fn kind(&self) -> &IntentionKind;

    fn readiness(&self) -> ReadinessRule {
        ReadinessRule::TOKEN_GATED
    }

    /// Execute one attempt. `Ok(Incomplete)` leaves the intention pending;
    /// an error archives it as failed with the error as detail.
    async fn run(&self, intention: &Intention, ctx: &RunContext<'_>) -> anyhow::Result<RunStatus>;

    /// Intentions to submit once `intention` has finished successfully.
    fn follow_ups(&self, _intention: &Intention) -> Vec<NewIntention> {
        Vec::new()
    }

    fn scope(&self) -> KindScope {
        KindScope::new(self.kind().clone(), self.readiness())
    }
}

/// What a running handler may see and touch.
pub struct RunContext<'a> {
    backlog: &'a dyn Backlog,
    job: &'a Job,
    user_id: UserId,
}

impl<'a> RunContext<'a> {
    pub fn new(backlog: &'a dyn Backlog, job: &'a Job, user_id: UserId) -> Self {
        Self {
            backlog,
            job,
            user_id,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    /// A job token of the intention's owner that is usable right now.
    ///
    /// Re-read at the point of use: the job's tokens may have been exhausted
    /// since the job was built.
    pub async fn usable_token(&self) -> Result<Option<Token>> {
        let now = Utc::now();
        Ok(self
            .backlog
            .job_tokens(self.job.id)
            .await?
            .into_iter()
            .find(|t| t.user_id == self.user_id && t.is_usable(now)))
    }

    /// Mark a token as exhausted until `reset`.
    pub async fn exhaust_token(&self, token: TokenId, reset: DateTime<Utc>) -> Result<()> {
        self.backlog.set_token_reset(token, reset).await
    }
}

/// Handlers indexed by kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<IntentionKind, Arc<dyn IntentionHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a registry of command handlers from configuration.
    pub fn from_config(configs: &[HandlerConfig]) -> Result<Self> {
        let mut registry = Self::empty();
        for config in configs {
            registry.register(Arc::new(CommandHandler::new(config.clone())))?;
        }
        Ok(registry)
    }

    /// Add a handler. A kind can only be registered once.
    pub fn register(&mut self, handler: Arc<dyn IntentionHandler>) -> Result<()> {
        let kind = handler.kind().clone();
        if self.handlers.contains_key(&kind) {
            return Err(Error::Config(format!("duplicate handler for kind {kind}")));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &IntentionKind) -> Option<&Arc<dyn IntentionHandler>> {
        self.handlers.get(kind)
    }

    /// Resolve a priority list of tags, failing on the first unknown one.
    pub fn resolve(&self, priority: &[IntentionKind]) -> Result<Vec<Arc<dyn IntentionHandler>>> {
        priority
            .iter()
            .map(|kind| {
                self.get(kind)
                    .cloned()
                    .ok_or_else(|| Error::UnknownKind(kind.to_string()))
            })
            .collect()
    }
}
