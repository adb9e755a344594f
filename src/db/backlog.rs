//! [`Backlog`] over Postgres.
//!
//! Claims run in one transaction: the job row is inserted, then candidate
//! intentions are locked with `FOR UPDATE SKIP LOCKED` and stamped with the
//! job id. Rows locked or already stamped by another worker are skipped.

use super::Db;
use crate::backlog::Backlog;
use crate::error::{Error, Result};
use crate::model::*;
use crate::sched::readiness::ReadinessRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Columns selected for an `Intention`, with prerequisites aggregated.
const INTENTION_COLUMNS: &str = "i.id, i.user_id, i.kind, i.params, i.job_id, i.created_at,
     COALESCE((SELECT array_agg(p.prereq_id) FROM intention_prereqs p WHERE p.intention_id = i.id),
              '{}') AS prerequisites";

/// Readiness of `i` as SQL. Binds: $1 kind, $2 needs_token, $3 now.
const READY: &str = "i.job_id IS NULL AND i.kind = $1
     AND NOT EXISTS (
         SELECT 1 FROM intention_prereqs p
         WHERE p.intention_id = i.id
         AND NOT EXISTS (SELECT 1 FROM archived_intentions a WHERE a.id = p.prereq_id))
     AND (NOT $2::boolean OR EXISTS (
         SELECT 1 FROM tokens t WHERE t.user_id = i.user_id AND t.reset <= $3))";

impl Db {
    /// Register a token. Token provisioning normally happens elsewhere;
    /// this exists for setup and tests.
    pub async fn insert_token(&self, token: &Token) -> Result<()> {
        sqlx::query("INSERT INTO tokens (id, user_id, secret, reset) VALUES ($1, $2, $3, $4)")
            .bind(token.id.0)
            .bind(token.user_id.0)
            .bind(token.secret.expose_secret())
            .bind(token.reset)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch an archived intention.
    pub async fn get_archived(&self, id: IntentionId) -> Result<ArchivedIntention> {
        let row: Option<ArchivedRow> = sqlx::query_as(
            "SELECT id, user_id, kind, params, outcome, error, job_id, created_at, archived_at
             FROM archived_intentions WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("archived intention {id}")))?
            .try_into_archived()
    }
}

/// Insert a pending intention and its prerequisite edges.
async fn insert_intention(conn: &mut PgConnection, new: NewIntention) -> Result<IntentionId> {
    let id = Uuid::new_v4();
    let prereqs: Vec<Uuid> = new.prerequisites.iter().map(|p| p.0).collect();

    sqlx::query(
        "INSERT INTO intentions (id, user_id, kind, params, created_at)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(new.user_id.0)
    .bind(new.kind.as_str())
    .bind(&new.params)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if !prereqs.is_empty() {
        sqlx::query(
            "INSERT INTO intention_prereqs (intention_id, prereq_id)
             SELECT $1, unnest($2::uuid[])",
        )
        .bind(id)
        .bind(&prereqs)
        .execute(&mut *conn)
        .await?;
    }
    Ok(IntentionId(id))
}

/// Move `id` to the archive if `job` still holds it.
async fn archive(
    conn: &mut PgConnection,
    job: JobId,
    id: IntentionId,
    outcome: ArchiveOutcome,
    error: Option<&str>,
) -> Result<()> {
    let rows_affected = sqlx::query(
        "WITH moved AS (DELETE FROM intentions WHERE id = $1 AND job_id = $5 RETURNING *)
         INSERT INTO archived_intentions
             (id, user_id, kind, params, outcome, error, job_id, created_at, archived_at)
         SELECT id, user_id, kind, params, $2::text, $3::text, job_id, created_at, $4::timestamptz
         FROM moved",
    )
    .bind(id.0)
    .bind(outcome.to_string())
    .bind(error)
    .bind(Utc::now())
    .bind(job.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(Error::ClaimLost(format!(
            "intention {id} is not held by job {job}"
        )));
    }
    Ok(())
}

fn lost_job(job: JobId) -> Error {
    Error::ClaimLost(format!("job {job} no longer exists"))
}

#[async_trait]
impl Backlog for Db {
    async fn submit(&self, new: NewIntention) -> Result<IntentionId> {
        let mut tx = self.pool.begin().await?;
        let id = insert_intention(&mut tx, new).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn get_intention(&self, id: IntentionId) -> Result<Intention> {
        let row: Option<IntentionRow> = sqlx::query_as(&format!(
            "SELECT {INTENTION_COLUMNS} FROM intentions i WHERE i.id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IntentionRow::into_intention)
            .ok_or_else(|| Error::NotFound(format!("intention {id}")))
    }

    async fn is_archived(&self, id: IntentionId) -> Result<bool> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM archived_intentions WHERE id = $1)")
                .bind(id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    async fn usable_tokens(&self, user: UserId, now: DateTime<Utc>) -> Result<Vec<Token>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            "SELECT id, user_id, secret, reset FROM tokens
             WHERE user_id = $1 AND reset <= $2
             ORDER BY reset",
        )
        .bind(user.0)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Token::from).collect())
    }

    async fn ready_users(
        &self,
        kind: &IntentionKind,
        rule: ReadinessRule,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(&format!(
            "SELECT DISTINCT i.user_id FROM intentions i WHERE {READY}"
        ))
        .bind(kind.as_str())
        .bind(rule.needs_token)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn ready_items(
        &self,
        kind: &IntentionKind,
        users: &[UserId],
        rule: ReadinessRule,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Intention>> {
        let users: Vec<Uuid> = users.iter().map(|u| u.0).collect();
        // LIMIT NULL is no limit.
        let limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows: Vec<IntentionRow> = sqlx::query_as(&format!(
            "SELECT {INTENTION_COLUMNS} FROM intentions i
             WHERE {READY} AND i.user_id = ANY($4)
             ORDER BY i.created_at, i.id
             LIMIT $5"
        ))
        .bind(kind.as_str())
        .bind(rule.needs_token)
        .bind(now)
        .bind(&users)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(IntentionRow::into_intention).collect())
    }

    async fn claim_for_job(&self, claim: JobClaim) -> Result<Option<Job>> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let candidates: Vec<Uuid> = claim.intentions.iter().map(|i| i.id.0).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO jobs (id, worker_id, created_at, touched_at) VALUES ($1, $2, $3, $3)",
        )
        .bind(job_id)
        .bind(claim.worker_id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "UPDATE intentions SET job_id = $1
             WHERE job_id IS NULL AND id IN (
                 SELECT id FROM intentions
                 WHERE id = ANY($2) AND job_id IS NULL
                 FOR UPDATE SKIP LOCKED)
             RETURNING id, user_id",
        )
        .bind(job_id)
        .bind(&candidates)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(None);
        }

        let won: BTreeSet<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        let users: BTreeSet<Uuid> = rows.iter().map(|(_, user)| *user).collect();
        // Keep the batch order.
        let intentions: Vec<Uuid> = candidates.into_iter().filter(|id| won.contains(id)).collect();
        let tokens: Vec<Uuid> = claim
            .tokens
            .iter()
            .filter(|t| users.contains(&t.user_id.0))
            .map(|t| t.id.0)
            .collect();

        sqlx::query("UPDATE jobs SET intentions = $2 WHERE id = $1")
            .bind(job_id)
            .bind(&intentions)
            .execute(&mut *tx)
            .await?;
        if !tokens.is_empty() {
            sqlx::query(
                "INSERT INTO job_tokens (job_id, token_id)
                 SELECT $1, t.id FROM tokens t WHERE t.id = ANY($2)",
            )
            .bind(job_id)
            .bind(&tokens)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(Some(Job {
            id: JobId(job_id),
            worker_id: claim.worker_id,
            intentions: intentions.into_iter().map(IntentionId).collect(),
            tokens: tokens.into_iter().map(TokenId).collect(),
            created_at: now,
            touched_at: now,
        }))
    }

    async fn job_tokens(&self, job: JobId) -> Result<Vec<Token>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            "SELECT t.id, t.user_id, t.secret, t.reset
             FROM tokens t JOIN job_tokens jt ON jt.token_id = t.id
             WHERE jt.job_id = $1",
        )
        .bind(job.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Token::from).collect())
    }

    async fn set_token_reset(&self, token: TokenId, reset: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query("UPDATE tokens SET reset = $1 WHERE id = $2")
            .bind(reset)
            .bind(token.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(Error::NotFound(format!("token {token}")));
        }
        Ok(())
    }

    async fn touch_job(&self, job: JobId) -> Result<()> {
        let rows_affected = sqlx::query("UPDATE jobs SET touched_at = $2 WHERE id = $1")
            .bind(job.0)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(lost_job(job));
        }
        Ok(())
    }

    async fn archive_success(
        &self,
        job: JobId,
        id: IntentionId,
        follow_ups: Vec<NewIntention>,
    ) -> Result<Vec<IntentionId>> {
        let mut tx = self.pool.begin().await?;
        archive(&mut tx, job, id, ArchiveOutcome::Success, None).await?;
        let mut spawned = Vec::with_capacity(follow_ups.len());
        for new in follow_ups {
            spawned.push(insert_intention(&mut tx, new).await?);
        }
        tx.commit().await?;
        Ok(spawned)
    }

    async fn archive_error(&self, job: JobId, id: IntentionId, detail: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        archive(&mut conn, job, id, ArchiveOutcome::Error, Some(detail)).await
    }

    async fn archive_job(&self, job: JobId, outcome: ArchiveOutcome) -> Result<()> {
        let rows_affected = sqlx::query(
            "WITH moved AS (DELETE FROM jobs WHERE id = $1 RETURNING *)
             INSERT INTO archived_jobs (id, worker_id, outcome, intentions, created_at, archived_at)
             SELECT id, worker_id, $2::text, intentions, created_at, $3::timestamptz FROM moved",
        )
        .bind(job.0)
        .bind(outcome.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(lost_job(job));
        }
        Ok(())
    }

    async fn dissolve_job(&self, job: JobId) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(lost_job(job));
        }
        Ok(())
    }

    async fn dissolve_stale_jobs(&self, silent_since: DateTime<Utc>) -> Result<u64> {
        let rows_affected = sqlx::query("DELETE FROM jobs WHERE touched_at < $1")
            .bind(silent_since)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected)
    }

    async fn counts(&self) -> Result<BTreeMap<IntentionKind, KindCounts>> {
        let pending: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT kind,
                    COUNT(*) FILTER (WHERE job_id IS NULL),
                    COUNT(*) FILTER (WHERE job_id IS NOT NULL)
             FROM intentions GROUP BY kind",
        )
        .fetch_all(&self.pool)
        .await?;
        let archived: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT kind,
                    COUNT(*) FILTER (WHERE outcome = 'success'),
                    COUNT(*) FILTER (WHERE outcome = 'error')
             FROM archived_intentions GROUP BY kind",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<IntentionKind, KindCounts> = BTreeMap::new();
        for (kind, unclaimed, claimed) in pending {
            let entry = counts.entry(IntentionKind::new(kind)).or_default();
            entry.pending = unclaimed as u64;
            entry.claimed = claimed as u64;
        }
        for (kind, succeeded, failed) in archived {
            let entry = counts.entry(IntentionKind::new(kind)).or_default();
            entry.succeeded = succeeded as u64;
            entry.failed = failed as u64;
        }
        Ok(counts)
    }
}

#[derive(sqlx::FromRow)]
struct IntentionRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    params: serde_json::Value,
    job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    prerequisites: Vec<Uuid>,
}

impl IntentionRow {
    fn into_intention(self) -> Intention {
        Intention {
            id: IntentionId(self.id),
            user_id: UserId(self.user_id),
            kind: IntentionKind::new(self.kind),
            params: self.params,
            prerequisites: self.prerequisites.into_iter().map(IntentionId).collect(),
            job_id: self.job_id.map(JobId),
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    user_id: Uuid,
    secret: String,
    reset: DateTime<Utc>,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: TokenId(row.id),
            user_id: UserId(row.user_id),
            secret: SecretString::from(row.secret),
            reset: row.reset,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArchivedRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    params: serde_json::Value,
    outcome: String,
    error: Option<String>,
    job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    archived_at: DateTime<Utc>,
}

impl ArchivedRow {
    fn try_into_archived(self) -> Result<ArchivedIntention> {
        Ok(ArchivedIntention {
            id: IntentionId(self.id),
            user_id: UserId(self.user_id),
            kind: IntentionKind::new(self.kind),
            params: self.params,
            outcome: self.outcome.parse()?,
            error: self.error,
            job_id: self.job_id.map(JobId),
            created_at: self.created_at,
            archived_at: self.archived_at,
        })
    }
}
