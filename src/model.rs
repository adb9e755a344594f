//! Core data model.
//!
//! An intention is one unit of pending work owned by a user. Intentions are
//! executed inside jobs, consume per-user tokens, and end up in an archive
//! with a success or error outcome.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Short display: first 8 chars of UUID
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Owner of intentions and tokens. The unit of fairness.
    UserId
);
uuid_id!(
    /// Identity of an intention. Prerequisites refer to intentions by ID only.
    IntentionId
);
uuid_id!(JobId);
uuid_id!(TokenId);
uuid_id!(
    /// Identity of one worker process. Every job records the worker that built it.
    WorkerId
);

/// Stable tag naming an intention variant (e.g. "github.raw").
///
/// Configuration lists tags in priority order; the handler registry maps
/// each tag to its handler.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentionKind(String);

impl IntentionKind {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IntentionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntentionKind {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

// ---------------------------------------------------------------------------
// Intention
// ---------------------------------------------------------------------------

/// A pending intention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intention {
    pub id: IntentionId,
    pub user_id: UserId,
    pub kind: IntentionKind,

    /// Parameters for the handler (repository, URL, ...). Opaque to the scheduler.
    pub params: serde_json::Value,

    /// Intentions that must be archived before this one is ready.
    pub prerequisites: BTreeSet<IntentionId>,

    /// Job currently holding this intention, if claimed.
    pub job_id: Option<JobId>,

    pub created_at: DateTime<Utc>,
}

impl Intention {
    pub fn is_claimed(&self) -> bool {
        self.job_id.is_some()
    }
}

/// Builder for submitting new intentions.
#[derive(Debug, Clone)]
pub struct NewIntention {
    pub(crate) user_id: UserId,
    pub(crate) kind: IntentionKind,
    pub(crate) params: serde_json::Value,
    pub(crate) prerequisites: BTreeSet<IntentionId>,
}

impl NewIntention {
    pub fn new(user_id: UserId, kind: impl Into<IntentionKind>) -> Self {
        Self {
            user_id,
            kind: kind.into(),
            params: serde_json::Value::Null,
            prerequisites: BTreeSet::new(),
        }
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Run only after `prerequisite` has been archived.
    pub fn after(mut self, prerequisite: IntentionId) -> Self {
        self.prerequisites.insert(prerequisite);
        self
    }

    pub(crate) fn into_intention(self, id: IntentionId, now: DateTime<Utc>) -> Intention {
        Intention {
            id,
            user_id: self.user_id,
            kind: self.kind,
            params: self.params,
            prerequisites: self.prerequisites,
            job_id: None,
            created_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A rate-limited credential belonging to one user.
///
/// Usable once `reset` is no longer in the future.
#[derive(Debug)]
pub struct Token {
    pub id: TokenId,
    pub user_id: UserId,
    pub secret: SecretString,
    pub reset: DateTime<Utc>,
}

impl Token {
    pub fn new(user_id: UserId, secret: impl Into<String>) -> Self {
        Self {
            id: TokenId::new(),
            user_id,
            secret: SecretString::from(secret.into()),
            reset: DateTime::<Utc>::default(),
        }
    }

    pub fn reset_at(mut self, reset: DateTime<Utc>) -> Self {
        self.reset = reset;
        self
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.reset <= now
    }
}

impl Clone for Token {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            user_id: self.user_id,
            secret: SecretString::from(self.secret.expose_secret().to_owned()),
            reset: self.reset,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One execution attempt over a fixed set of claimed intentions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub intentions: Vec<IntentionId>,
    /// Tokens reserved for the job, one per distinct user.
    pub tokens: Vec<TokenId>,
    pub created_at: DateTime<Utc>,
    /// Last heartbeat from the owning worker. Jobs silent for too long are
    /// presumed orphaned.
    pub touched_at: DateTime<Utc>,
}

/// A job reservation handed to the backlog's claim operation.
#[derive(Debug, Clone)]
pub struct JobClaim {
    pub worker_id: WorkerId,
    pub intentions: Vec<Intention>,
    pub tokens: Vec<Token>,
}

// ---------------------------------------------------------------------------
// Run status and outcomes
// ---------------------------------------------------------------------------

/// What a handler's run reports when it returns without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Partial progress; stays pending and is picked up again later.
    Incomplete,
    /// Finished; archived as success.
    Done,
}

/// Terminal outcome of an archived intention or job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Success,
    Error,
}

impl std::fmt::Display for ArchiveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArchiveOutcome::Success => "success",
            ArchiveOutcome::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ArchiveOutcome {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ArchiveOutcome::Success),
            "error" => Ok(ArchiveOutcome::Error),
            other => Err(crate::error::Error::Other(format!(
                "unknown archive outcome: {other}"
            ))),
        }
    }
}

/// Immutable record of an archived intention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedIntention {
    pub id: IntentionId,
    pub user_id: UserId,
    pub kind: IntentionKind,
    pub params: serde_json::Value,
    pub outcome: ArchiveOutcome,
    pub error: Option<String>,
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

impl ArchivedIntention {
    pub(crate) fn from_intention(
        intention: Intention,
        outcome: ArchiveOutcome,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: intention.id,
            user_id: intention.user_id,
            kind: intention.kind,
            params: intention.params,
            outcome,
            error,
            job_id: intention.job_id,
            created_at: intention.created_at,
            archived_at: now,
        }
    }
}

/// Immutable record of an archived job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub outcome: ArchiveOutcome,
    pub intentions: Vec<IntentionId>,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

/// Pending and archived totals for one intention kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub pending: u64,
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
}
