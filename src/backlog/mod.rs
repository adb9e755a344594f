//! The shared backlog the scheduler reads from and claims against.
//!
//! Every worker process talks to the same backlog. Implementations must make
//! [`Backlog::claim_for_job`] atomic: once an intention belongs to a job, no
//! other caller can claim it until the job is archived or dissolved.

pub mod memory;

use crate::error::Result;
use crate::model::*;
use crate::sched::readiness::ReadinessRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub use memory::MemoryBacklog;

#[async_trait]
pub trait Backlog: Send + Sync {
    /// Add a new pending intention.
    async fn submit(&self, new: NewIntention) -> Result<IntentionId>;

    /// Fetch a pending intention.
    async fn get_intention(&self, id: IntentionId) -> Result<Intention>;

    /// Whether `id` has reached the archive, with either outcome.
    async fn is_archived(&self, id: IntentionId) -> Result<bool>;

    /// Tokens owned by `user` with `reset <= now`.
    async fn usable_tokens(&self, user: UserId, now: DateTime<Utc>) -> Result<Vec<Token>>;

    /// Distinct users with at least one ready, unclaimed intention of `kind`.
    async fn ready_users(
        &self,
        kind: &IntentionKind,
        rule: ReadinessRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>>;

    /// Ready, unclaimed intentions of `kind` owned by `users`, oldest first.
    /// `limit` of `None` means no limit.
    async fn ready_items(
        &self,
        kind: &IntentionKind,
        users: &[UserId],
        rule: ReadinessRule,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Intention>>;

    /// Atomically reserve the claim's intentions for a new job.
    ///
    /// Intentions already held by another job are skipped. Returns `None`
    /// when nothing could be claimed. The job only references tokens whose
    /// owner is represented among the claimed intentions.
    async fn claim_for_job(&self, claim: JobClaim) -> Result<Option<Job>>;

    /// Tokens reserved for a job, as currently stored.
    async fn job_tokens(&self, job: JobId) -> Result<Vec<Token>>;

    /// Push a token's reset time (used by run side effects on exhaustion).
    async fn set_token_reset(&self, token: TokenId, reset: DateTime<Utc>) -> Result<()>;

    /// Record a heartbeat for a running job.
    ///
    /// Fails with [`Error::ClaimLost`](crate::error::Error::ClaimLost) when the
    /// job is gone (dissolved as stale).
    async fn touch_job(&self, job: JobId) -> Result<()>;

    /// Archive `id` as success and submit `follow_ups`, all or nothing.
    ///
    /// `job` must still hold `id`, otherwise nothing changes and the call
    /// fails with `ClaimLost`. Returns the ids of the submitted follow-ups.
    async fn archive_success(
        &self,
        job: JobId,
        id: IntentionId,
        follow_ups: Vec<NewIntention>,
    ) -> Result<Vec<IntentionId>>;

    /// Archive `id` as error. `job` must still hold it.
    async fn archive_error(&self, job: JobId, id: IntentionId, detail: &str) -> Result<()>;

    /// Archive a job. Intentions it still holds go back to pending.
    /// `ClaimLost` if the job is gone.
    async fn archive_job(&self, job: JobId, outcome: ArchiveOutcome) -> Result<()>;

    /// Drop a job without an archive record, releasing its intentions.
    /// `ClaimLost` if the job is gone.
    async fn dissolve_job(&self, job: JobId) -> Result<()>;

    /// Dissolve every job whose last heartbeat is older than `silent_since`.
    /// Returns how many were dropped.
    async fn dissolve_stale_jobs(&self, silent_since: DateTime<Utc>) -> Result<u64>;

    /// Pending and archived totals per kind.
    async fn counts(&self) -> Result<BTreeMap<IntentionKind, KindCounts>>;
}
