//! Job building: claim a batch of intentions plus the tokens they will use.

use super::KindScope;
use crate::error::{Error, Result};
use crate::model::{Intention, Job, JobClaim, UserId};
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, info};

impl super::Scheduler {
    /// Claim `intentions` for a new job owned by this worker.
    ///
    /// One currently usable token is attached per distinct owner. Intentions
    /// claimed meanwhile by another worker are dropped from the job; `None`
    /// means every one of them was taken.
    pub async fn new_job(&self, intentions: Vec<Intention>) -> Result<Option<Job>> {
        if intentions.is_empty() {
            return Err(Error::EmptyJob);
        }

        let now = Utc::now();
        let mut owners: Vec<UserId> = Vec::new();
        for intention in &intentions {
            if !owners.contains(&intention.user_id) {
                owners.push(intention.user_id);
            }
        }

        let mut tokens = Vec::with_capacity(owners.len());
        for owner in owners {
            if let Some(token) = self
                .backlog
                .usable_tokens(owner, now)
                .await?
                .into_iter()
                .next()
            {
                tokens.push(token);
            }
        }

        let requested = intentions.len();
        let kind = intentions[0].kind.clone();
        let job = self
            .backlog
            .claim_for_job(JobClaim {
                worker_id: self.worker_id,
                intentions,
                tokens,
            })
            .await?;

        let claimed = job.as_ref().map_or(0, |j| j.intentions.len());
        if claimed < requested {
            debug!(kind = %kind, requested, claimed, "claim conflict");
            metrics::claim_conflicts().add(
                (requested - claimed) as u64,
                &[KeyValue::new("kind", kind.to_string())],
            );
        }

        if let Some(ref job) = job {
            info!(
                job_id = %job.id,
                worker_id = %self.worker_id,
                kind = %kind,
                intentions = job.intentions.len(),
                tokens = job.tokens.len(),
                "job created"
            );
            metrics::jobs_created().add(1, &[KeyValue::new("kind", kind.to_string())]);
        }
        Ok(job)
    }

    /// Select up to `max_users` users and claim up to `max_users` of their
    /// ready intentions as one job. `None` when there is no eligible work.
    pub async fn get_new_job(&mut self, scope: &KindScope, max_users: usize) -> Result<Option<Job>> {
        self.get_new_job_with(scope, max_users, Some(max_users)).await
    }

    /// Like [`get_new_job`](Self::get_new_job) with an independent batch bound.
    pub async fn get_new_job_with(
        &mut self,
        scope: &KindScope,
        max_users: usize,
        max_intentions: Option<usize>,
    ) -> Result<Option<Job>> {
        let users = self.select_ready_users(scope, max_users).await?;
        if users.is_empty() {
            return Ok(None);
        }
        let intentions = self
            .collect_intentions(scope, &users, max_intentions)
            .await?;
        if intentions.is_empty() {
            return Ok(None);
        }
        self.new_job(intentions).await
    }
}
