//! In-process backlog.
//!
//! All state sits behind one mutex, so every operation (including claims)
//! is atomic with respect to other callers sharing the same `MemoryBacklog`.

use super::Backlog;
use crate::error::{Error, Result};
use crate::model::*;
use crate::sched::readiness::{self, ReadinessRule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    pending: HashMap<IntentionId, Intention>,
    archived: HashMap<IntentionId, ArchivedIntention>,
    tokens: BTreeMap<TokenId, Token>,
    jobs: HashMap<JobId, Job>,
    archived_jobs: Vec<ArchivedJob>,
}

impl State {
    fn usable_tokens(&self, user: UserId, now: DateTime<Utc>) -> Vec<Token> {
        self.tokens
            .values()
            .filter(|t| t.user_id == user && t.is_usable(now))
            .cloned()
            .collect()
    }

    fn is_ready(&self, intention: &Intention, rule: ReadinessRule, now: DateTime<Utc>) -> bool {
        let tokens = self.usable_tokens(intention.user_id, now);
        readiness::diagnose(
            intention,
            rule,
            |id| self.archived.contains_key(&id),
            &tokens,
            now,
        )
        .is_ready()
    }

    /// Ready intentions of `kind`, oldest first.
    fn ready<'a>(
        &'a self,
        kind: &'a IntentionKind,
        rule: ReadinessRule,
        now: DateTime<Utc>,
    ) -> Vec<&'a Intention> {
        let mut ready: Vec<&Intention> = self
            .pending
            .values()
            .filter(|i| &i.kind == kind && self.is_ready(i, rule, now))
            .collect();
        ready.sort_by_key(|i| (i.created_at, i.id));
        ready
    }

    fn release(&mut self, job: JobId) {
        for intention in self.pending.values_mut() {
            if intention.job_id == Some(job) {
                intention.job_id = None;
            }
        }
    }

    fn insert(&mut self, new: NewIntention) -> IntentionId {
        let id = IntentionId::new();
        self.pending.insert(id, new.into_intention(id, Utc::now()));
        id
    }

    /// Move `id` to the archive if `job` still holds it.
    fn archive(
        &mut self,
        job: JobId,
        id: IntentionId,
        outcome: ArchiveOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let intention = match self.pending.entry(id) {
            Entry::Occupied(entry) if entry.get().job_id == Some(job) => entry.remove(),
            _ => return Err(lost_intention(job, id)),
        };
        let record = ArchivedIntention::from_intention(intention, outcome, error, Utc::now());
        self.archived.insert(id, record);
        Ok(())
    }
}

fn lost_intention(job: JobId, id: IntentionId) -> Error {
    Error::ClaimLost(format!("intention {id} is not held by job {job}"))
}

fn lost_job(job: JobId) -> Error {
    Error::ClaimLost(format!("job {job} no longer exists"))
}

/// Backlog kept entirely in memory.
#[derive(Default)]
pub struct MemoryBacklog {
    state: Mutex<State>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a token.
    pub fn add_token(&self, token: Token) -> TokenId {
        let id = token.id;
        self.state().tokens.insert(id, token);
        id
    }

    pub fn token(&self, id: TokenId) -> Option<Token> {
        self.state().tokens.get(&id).cloned()
    }

    pub fn pending(&self) -> Vec<Intention> {
        let mut pending: Vec<Intention> = self.state().pending.values().cloned().collect();
        pending.sort_by_key(|i| (i.created_at, i.id));
        pending
    }

    pub fn archived(&self) -> Vec<ArchivedIntention> {
        let mut archived: Vec<ArchivedIntention> =
            self.state().archived.values().cloned().collect();
        archived.sort_by_key(|a| a.archived_at);
        archived
    }

    pub fn archived_intention(&self, id: IntentionId) -> Option<ArchivedIntention> {
        self.state().archived.get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    pub fn archived_jobs(&self) -> Vec<ArchivedJob> {
        self.state().archived_jobs.clone()
    }
}

#[async_trait]
impl Backlog for MemoryBacklog {
    async fn submit(&self, new: NewIntention) -> Result<IntentionId> {
        Ok(self.state().insert(new))
    }

    async fn get_intention(&self, id: IntentionId) -> Result<Intention> {
        self.state()
            .pending
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("intention {id}")))
    }

    async fn is_archived(&self, id: IntentionId) -> Result<bool> {
        Ok(self.state().archived.contains_key(&id))
    }

    async fn usable_tokens(&self, user: UserId, now: DateTime<Utc>) -> Result<Vec<Token>> {
        Ok(self.state().usable_tokens(user, now))
    }

    async fn ready_users(
        &self,
        kind: &IntentionKind,
        rule: ReadinessRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let state = self.state();
        let users: BTreeSet<UserId> = state
            .ready(kind, rule, now)
            .into_iter()
            .map(|i| i.user_id)
            .collect();
        Ok(users.into_iter().collect())
    }

    async fn ready_items(
        &self,
        kind: &IntentionKind,
        users: &[UserId],
        rule: ReadinessRule,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Intention>> {
        let state = self.state();
        let items = state
            .ready(kind, rule, now)
            .into_iter()
            .filter(|i| users.contains(&i.user_id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(items)
    }

    async fn claim_for_job(&self, claim: JobClaim) -> Result<Option<Job>> {
        let mut state = self.state();
        let job_id = JobId::new();
        let now = Utc::now();

        let mut claimed = Vec::new();
        let mut users = BTreeSet::new();
        for candidate in &claim.intentions {
            if let Some(intention) = state.pending.get_mut(&candidate.id) {
                if intention.job_id.is_none() {
                    intention.job_id = Some(job_id);
                    claimed.push(intention.id);
                    users.insert(intention.user_id);
                }
            }
        }
        if claimed.is_empty() {
            return Ok(None);
        }

        let tokens = claim
            .tokens
            .iter()
            .filter(|t| users.contains(&t.user_id) && state.tokens.contains_key(&t.id))
            .map(|t| t.id)
            .collect();

        let job = Job {
            id: job_id,
            worker_id: claim.worker_id,
            intentions: claimed,
            tokens,
            created_at: now,
            touched_at: now,
        };
        state.jobs.insert(job_id, job.clone());
        Ok(Some(job))
    }

    async fn job_tokens(&self, job: JobId) -> Result<Vec<Token>> {
        let state = self.state();
        let job = state
            .jobs
            .get(&job)
            .ok_or_else(|| Error::NotFound(format!("job {job}")))?;
        Ok(job
            .tokens
            .iter()
            .filter_map(|id| state.tokens.get(id).cloned())
            .collect())
    }

    async fn set_token_reset(&self, token: TokenId, reset: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let token = state
            .tokens
            .get_mut(&token)
            .ok_or_else(|| Error::NotFound(format!("token {token}")))?;
        token.reset = reset;
        Ok(())
    }

    async fn touch_job(&self, job: JobId) -> Result<()> {
        let mut state = self.state();
        let job = state.jobs.get_mut(&job).ok_or_else(|| lost_job(job))?;
        job.touched_at = Utc::now();
        Ok(())
    }

    async fn archive_success(
        &self,
        job: JobId,
        id: IntentionId,
        follow_ups: Vec<NewIntention>,
    ) -> Result<Vec<IntentionId>> {
        let mut state = self.state();
        state.archive(job, id, ArchiveOutcome::Success, None)?;
        Ok(follow_ups.into_iter().map(|new| state.insert(new)).collect())
    }

    async fn archive_error(&self, job: JobId, id: IntentionId, detail: &str) -> Result<()> {
        self.state()
            .archive(job, id, ArchiveOutcome::Error, Some(detail.to_string()))
    }

    async fn archive_job(&self, job: JobId, outcome: ArchiveOutcome) -> Result<()> {
        let mut state = self.state();
        let job = state.jobs.remove(&job).ok_or_else(|| lost_job(job))?;
        state.release(job.id);
        state.archived_jobs.push(ArchivedJob {
            id: job.id,
            worker_id: job.worker_id,
            outcome,
            intentions: job.intentions,
            created_at: job.created_at,
            archived_at: Utc::now(),
        });
        Ok(())
    }

    async fn dissolve_job(&self, job: JobId) -> Result<()> {
        let mut state = self.state();
        state.jobs.remove(&job).ok_or_else(|| lost_job(job))?;
        state.release(job);
        Ok(())
    }

    async fn dissolve_stale_jobs(&self, silent_since: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.touched_at < silent_since)
            .map(|j| j.id)
            .collect();
        for id in &stale {
            state.jobs.remove(id);
            state.release(*id);
        }
        Ok(stale.len() as u64)
    }

    async fn counts(&self) -> Result<BTreeMap<IntentionKind, KindCounts>> {
        let state = self.state();
        let mut counts: BTreeMap<IntentionKind, KindCounts> = BTreeMap::new();
        for intention in state.pending.values() {
            let entry = counts.entry(intention.kind.clone()).or_default();
            if intention.is_claimed() {
                entry.claimed += 1;
            } else {
                entry.pending += 1;
            }
        }
        for archived in state.archived.values() {
            let entry = counts.entry(archived.kind.clone()).or_default();
            match archived.outcome {
                ArchiveOutcome::Success => entry.succeeded += 1,
                ArchiveOutcome::Error => entry.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn claim_skips_intentions_held_by_another_job() {
        let backlog = MemoryBacklog::new();
        let user = UserId::new();
        backlog.add_token(Token::new(user, "t"));
        let id = backlog
            .submit(NewIntention::new(user, "github.raw"))
            .await
            .unwrap();
        let intention = backlog.get_intention(id).await.unwrap();

        let claim = JobClaim {
            worker_id: WorkerId::new(),
            intentions: vec![intention],
            tokens: vec![],
        };
        let first = backlog.claim_for_job(claim.clone()).await.unwrap();
        assert!(first.is_some());
        let second = backlog.claim_for_job(claim).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn archive_job_releases_unfinished_intentions() {
        let backlog = MemoryBacklog::new();
        let user = UserId::new();
        let a = backlog.submit(NewIntention::new(user, "k")).await.unwrap();
        let b = backlog.submit(NewIntention::new(user, "k")).await.unwrap();
        let intentions = vec![
            backlog.get_intention(a).await.unwrap(),
            backlog.get_intention(b).await.unwrap(),
        ];
        let job = backlog
            .claim_for_job(JobClaim {
                worker_id: WorkerId::new(),
                intentions,
                tokens: vec![],
            })
            .await
            .unwrap()
            .unwrap();

        backlog.archive_success(job.id, a, vec![]).await.unwrap();
        backlog
            .archive_job(job.id, ArchiveOutcome::Success)
            .await
            .unwrap();

        assert!(!backlog.get_intention(b).await.unwrap().is_claimed());
        assert_eq!(backlog.archived_jobs()[0].intentions, vec![a, b]);
    }

    async fn claim(backlog: &MemoryBacklog, ids: &[IntentionId]) -> Job {
        let mut intentions = Vec::new();
        for id in ids {
            intentions.push(backlog.get_intention(*id).await.unwrap());
        }
        backlog
            .claim_for_job(JobClaim {
                worker_id: WorkerId::new(),
                intentions,
                tokens: vec![],
            })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn archive_requires_the_holding_job() {
        let backlog = MemoryBacklog::new();
        let user = UserId::new();
        let id = backlog.submit(NewIntention::new(user, "k")).await.unwrap();
        let old = claim(&backlog, &[id]).await;
        backlog.dissolve_job(old.id).await.unwrap();
        let current = claim(&backlog, &[id]).await;

        let err = backlog
            .archive_success(old.id, id, vec![NewIntention::new(user, "next")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimLost(_)));
        let err = backlog.archive_error(old.id, id, "late").await.unwrap_err();
        assert!(matches!(err, Error::ClaimLost(_)));
        assert!(matches!(
            backlog.archive_job(old.id, ArchiveOutcome::Success).await,
            Err(Error::ClaimLost(_))
        ));

        // Nothing moved and no follow-up was submitted.
        assert_eq!(backlog.get_intention(id).await.unwrap().job_id, Some(current.id));
        assert_eq!(backlog.pending().len(), 1);
        assert!(backlog.archived().is_empty());
    }

    #[tokio::test]
    async fn archive_success_submits_follow_ups_together() {
        let backlog = MemoryBacklog::new();
        let user = UserId::new();
        let id = backlog.submit(NewIntention::new(user, "k")).await.unwrap();
        let job = claim(&backlog, &[id]).await;

        let spawned = backlog
            .archive_success(job.id, id, vec![NewIntention::new(user, "next").after(id)])
            .await
            .unwrap();

        assert_eq!(spawned.len(), 1);
        let follow_up = backlog.get_intention(spawned[0]).await.unwrap();
        assert!(follow_up.prerequisites.contains(&id));
        assert!(backlog.archived_intention(id).is_some());
    }

    #[tokio::test]
    async fn touched_jobs_are_not_stale() {
        let backlog = MemoryBacklog::new();
        let user = UserId::new();
        let id = backlog.submit(NewIntention::new(user, "k")).await.unwrap();
        let job = claim(&backlog, &[id]).await;

        let cutoff = Utc::now() + Duration::milliseconds(1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        backlog.touch_job(job.id).await.unwrap();

        assert_eq!(backlog.dissolve_stale_jobs(cutoff).await.unwrap(), 0);
        assert_eq!(backlog.jobs().len(), 1);

        backlog.dissolve_job(job.id).await.unwrap();
        assert!(matches!(
            backlog.touch_job(job.id).await,
            Err(Error::ClaimLost(_))
        ));
    }

    #[tokio::test]
    async fn stale_jobs_are_dissolved() {
        let backlog = MemoryBacklog::new();
        let user = UserId::new();
        let id = backlog.submit(NewIntention::new(user, "k")).await.unwrap();
        let intention = backlog.get_intention(id).await.unwrap();
        backlog
            .claim_for_job(JobClaim {
                worker_id: WorkerId::new(),
                intentions: vec![intention],
                tokens: vec![],
            })
            .await
            .unwrap();

        let none = backlog
            .dissolve_stale_jobs(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(none, 0);

        let dropped = backlog
            .dissolve_stale_jobs(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(dropped, 1);
        assert!(backlog.jobs().is_empty());
        assert!(!backlog.get_intention(id).await.unwrap().is_claimed());
    }
}
