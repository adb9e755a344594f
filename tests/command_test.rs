//! Command handlers driven end to end through a worker.
#![cfg(unix)]

use chrono::{TimeZone, Utc};
use poolsched::backlog::{Backlog, MemoryBacklog};
use poolsched::config::WorkerConfig;
use poolsched::engine::Worker;
use poolsched::handler::HandlerRegistry;
use poolsched::model::*;
use std::sync::Arc;

/// Worker config with a single `/bin/sh -c <script>` handler for `github.raw`.
fn shell_config(script: &str, extra: &str) -> WorkerConfig {
    let toml = format!(
        r#"
priority = ["github.raw"{extra_kind}]
finish = true

[[handler]]
kind = "github.raw"
command = "/bin/sh"
args = ["-c", {script:?}]
{extra}
"#,
        extra_kind = if extra.is_empty() {
            ""
        } else {
            r#", "github.enrich""#
        },
    );
    WorkerConfig::from_toml(&toml).unwrap()
}

fn worker_for(backlog: &Arc<MemoryBacklog>, config: &WorkerConfig) -> Worker {
    let registry = HandlerRegistry::from_config(&config.handlers).unwrap();
    let backlog: Arc<dyn Backlog> = backlog.clone();
    Worker::from_registry(
        backlog,
        &registry,
        &config.priority,
        config.loop_config(false).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn zero_exit_archives_success_with_env_passed_through() {
    let backlog = Arc::new(MemoryBacklog::new());
    let user = UserId::new();
    backlog.add_token(Token::new(user, "ghp_secret"));
    let id = backlog
        .submit(NewIntention::new(user, "github.raw").params(serde_json::json!({"repo": "a/b"})))
        .await
        .unwrap();

    let script = r#"
test "$POOLSCHED_TOKEN" = "ghp_secret" || exit 3
test "$POOLSCHED_KIND" = "github.raw" || exit 4
test -n "$POOLSCHED_JOB_ID" || exit 5
case "$POOLSCHED_PARAMS" in *a/b*) ;; *) exit 6 ;; esac
exit 0
"#;
    let config = shell_config(script, "");
    let stats = worker_for(&backlog, &config).run().await.unwrap();

    assert_eq!(stats.succeeded, 1, "stats: {stats:?}");
    let archived = backlog.archived_intention(id).unwrap();
    assert_eq!(archived.outcome, ArchiveOutcome::Success);
}

#[tokio::test]
async fn nonzero_exit_archives_error_with_stderr() {
    let backlog = Arc::new(MemoryBacklog::new());
    let user = UserId::new();
    backlog.add_token(Token::new(user, "ghp_secret"));
    let id = backlog
        .submit(NewIntention::new(user, "github.raw"))
        .await
        .unwrap();

    let config = shell_config("echo 'repository not found' >&2; exit 2", "");
    let stats = worker_for(&backlog, &config).run().await.unwrap();

    assert_eq!(stats.failed, 1);
    let archived = backlog.archived_intention(id).unwrap();
    assert_eq!(archived.outcome, ArchiveOutcome::Error);
    let detail = archived.error.unwrap();
    assert!(detail.contains("status 2"), "detail: {detail}");
    assert!(detail.contains("repository not found"), "detail: {detail}");
}

#[tokio::test]
async fn tempfail_exit_exhausts_token_and_leaves_intention_pending() {
    let backlog = Arc::new(MemoryBacklog::new());
    let user = UserId::new();
    let token = backlog.add_token(Token::new(user, "ghp_secret"));
    let id = backlog
        .submit(NewIntention::new(user, "github.raw"))
        .await
        .unwrap();

    let config = shell_config("echo 'fetched 30 pages'; echo 'reset 2999-01-01T00:00:00Z'; exit 75", "");
    let stats = worker_for(&backlog, &config).run().await.unwrap();

    assert_eq!(stats.incomplete, 1);
    assert_eq!(stats.jobs, 1);

    let pending = backlog.get_intention(id).await.unwrap();
    assert!(!pending.is_claimed());
    let reset = backlog.token(token).unwrap().reset;
    assert_eq!(reset, Utc.with_ymd_and_hms(2999, 1, 1, 0, 0, 0).unwrap());
    assert!(backlog.archived_jobs().is_empty());
}

#[tokio::test]
async fn configured_follow_up_is_submitted_after_success() {
    let backlog = Arc::new(MemoryBacklog::new());
    let user = UserId::new();
    backlog.add_token(Token::new(user, "ghp_secret"));
    let raw = backlog
        .submit(NewIntention::new(user, "github.raw").params(serde_json::json!({"repo": "a/b"})))
        .await
        .unwrap();

    let extra = r#"follow_up = "github.enrich"

[[handler]]
kind = "github.enrich"
command = "/bin/sh"
args = ["-c", "exit 0"]
needs_token = false"#;
    let config = shell_config("exit 0", extra);
    let stats = worker_for(&backlog, &config).run().await.unwrap();

    assert_eq!(stats.succeeded, 2);
    let archived = backlog.archived();
    let enrich = archived
        .iter()
        .find(|a| a.kind.as_str() == "github.enrich")
        .unwrap();
    assert_ne!(enrich.id, raw);
    assert_eq!(enrich.user_id, user);
    assert_eq!(enrich.params, serde_json::json!({"repo": "a/b"}));
}
