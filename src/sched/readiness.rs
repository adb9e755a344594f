//! Readiness: can an intention run right now?
//!
//! An intention is ready when it is not held by a job, every prerequisite has
//! been archived (success or error), and, for token-gated kinds, its owner
//! has at least one token whose `reset` is not in the future.

use crate::backlog::Backlog;
use crate::error::Result;
use crate::model::{Intention, IntentionId, JobId, Token};
use chrono::{DateTime, Utc};

/// Per-kind readiness rule, supplied by the kind's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessRule {
    pub needs_token: bool,
}

impl ReadinessRule {
    pub const TOKEN_GATED: Self = Self { needs_token: true };
    pub const UNGATED: Self = Self { needs_token: false };
}

impl Default for ReadinessRule {
    fn default() -> Self {
        Self::TOKEN_GATED
    }
}

/// Why an intention is or is not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Already part of a job.
    Claimed(JobId),
    /// Waiting for this prerequisite to be archived.
    BlockedOn(IntentionId),
    /// Every token of the owner is still resetting.
    NoUsableToken,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Evaluate readiness against a snapshot of the backlog.
///
/// `is_archived` answers whether a prerequisite has reached the archive;
/// `tokens` are the owner's tokens (usability is checked against `now`).
pub fn diagnose(
    intention: &Intention,
    rule: ReadinessRule,
    is_archived: impl Fn(IntentionId) -> bool,
    tokens: &[Token],
    now: DateTime<Utc>,
) -> Readiness {
    if let Some(job) = intention.job_id {
        return Readiness::Claimed(job);
    }
    if let Some(prereq) = intention
        .prerequisites
        .iter()
        .copied()
        .find(|p| !is_archived(*p))
    {
        return Readiness::BlockedOn(prereq);
    }
    if rule.needs_token
        && !tokens
            .iter()
            .any(|t| t.user_id == intention.user_id && t.is_usable(now))
    {
        return Readiness::NoUsableToken;
    }
    Readiness::Ready
}

/// Diagnose a single intention by querying the backlog.
pub async fn resolve(
    backlog: &dyn Backlog,
    intention: &Intention,
    rule: ReadinessRule,
    now: DateTime<Utc>,
) -> Result<Readiness> {
    let mut archived = Vec::with_capacity(intention.prerequisites.len());
    for prereq in &intention.prerequisites {
        if backlog.is_archived(*prereq).await? {
            archived.push(*prereq);
        }
    }
    let tokens = if rule.needs_token {
        backlog.usable_tokens(intention.user_id, now).await?
    } else {
        Vec::new()
    };
    Ok(diagnose(
        intention,
        rule,
        |id| archived.contains(&id),
        &tokens,
        now,
    ))
}

/// `true` iff `intention` may run now.
pub async fn is_ready(
    backlog: &dyn Backlog,
    intention: &Intention,
    rule: ReadinessRule,
    now: DateTime<Utc>,
) -> Result<bool> {
    Ok(resolve(backlog, intention, rule, now).await?.is_ready())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IntentionKind, UserId};
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn intention(user: UserId, prereqs: &[IntentionId]) -> Intention {
        Intention {
            id: IntentionId::new(),
            user_id: user,
            kind: IntentionKind::new("github.raw"),
            params: serde_json::Value::Null,
            prerequisites: prereqs.iter().copied().collect::<BTreeSet<_>>(),
            job_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ready_with_no_prerequisites_and_a_usable_token() {
        let user = UserId::new();
        let now = Utc::now();
        let tokens = [Token::new(user, "t").reset_at(now - Duration::seconds(1))];
        let r = diagnose(
            &intention(user, &[]),
            ReadinessRule::TOKEN_GATED,
            |_| false,
            &tokens,
            now,
        );
        assert_eq!(r, Readiness::Ready);
    }

    #[test]
    fn reset_exactly_now_is_usable() {
        let user = UserId::new();
        let now = Utc::now();
        let tokens = [Token::new(user, "t").reset_at(now)];
        let r = diagnose(
            &intention(user, &[]),
            ReadinessRule::TOKEN_GATED,
            |_| false,
            &tokens,
            now,
        );
        assert!(r.is_ready());
    }

    #[test]
    fn future_reset_blocks_token_gated_kinds_only() {
        let user = UserId::new();
        let now = Utc::now();
        let tokens = [Token::new(user, "t").reset_at(now + Duration::seconds(60))];
        let i = intention(user, &[]);
        assert_eq!(
            diagnose(&i, ReadinessRule::TOKEN_GATED, |_| false, &tokens, now),
            Readiness::NoUsableToken
        );
        assert!(diagnose(&i, ReadinessRule::UNGATED, |_| false, &tokens, now).is_ready());
    }

    #[test]
    fn another_users_token_does_not_count() {
        let now = Utc::now();
        let tokens = [Token::new(UserId::new(), "t")];
        let r = diagnose(
            &intention(UserId::new(), &[]),
            ReadinessRule::TOKEN_GATED,
            |_| false,
            &tokens,
            now,
        );
        assert_eq!(r, Readiness::NoUsableToken);
    }

    #[test]
    fn unarchived_prerequisite_blocks() {
        let user = UserId::new();
        let done = IntentionId::new();
        let waiting = IntentionId::new();
        let i = intention(user, &[done, waiting]);
        let tokens = [Token::new(user, "t")];
        let r = diagnose(
            &i,
            ReadinessRule::TOKEN_GATED,
            |id| id == done,
            &tokens,
            Utc::now(),
        );
        assert_eq!(r, Readiness::BlockedOn(waiting));
    }

    #[test]
    fn claimed_intention_is_not_ready() {
        let user = UserId::new();
        let mut i = intention(user, &[]);
        let job = JobId::new();
        i.job_id = Some(job);
        let r = diagnose(&i, ReadinessRule::UNGATED, |_| true, &[], Utc::now());
        assert_eq!(r, Readiness::Claimed(job));
    }
}
