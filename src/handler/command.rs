//! Handlers that run an external command per intention.
//!
//! The command receives the intention through `POOLSCHED_*` environment
//! variables. Exit status 0 means done, 75 (`EX_TEMPFAIL`) means incomplete,
//! anything else is a failure. An incomplete run may print
//! `reset <RFC 3339 timestamp>` on stdout to report that its token is
//! exhausted until then.

use super::{IntentionHandler, RunContext};
use crate::model::*;
use crate::sched::readiness::ReadinessRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status reporting partial progress.
pub const EXIT_INCOMPLETE: i32 = 75;

/// `[[handler]]` entry of the worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerConfig {
    pub kind: IntentionKind,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_needs_token")]
    pub needs_token: bool,
    /// Kind to submit for the same user after a successful run.
    #[serde(default)]
    pub follow_up: Option<IntentionKind>,
}

fn default_needs_token() -> bool {
    true
}

pub struct CommandHandler {
    config: HandlerConfig,
}

impl CommandHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self { config }
    }

    fn command_path(&self) -> std::io::Result<PathBuf> {
        // Relative commands are resolved against the process CWD.
        let command: &Path = &self.config.command;
        if command.is_relative() {
            Ok(std::env::current_dir()?.join(command))
        } else {
            Ok(command.to_path_buf())
        }
    }
}

#[async_trait]
impl IntentionHandler for CommandHandler {
    fn kind(&self) -> &IntentionKind {
        &self.config.kind
    }

    fn readiness(&self) -> ReadinessRule {
        ReadinessRule {
            needs_token: self.config.needs_token,
        }
    }

    async fn run(&self, intention: &Intention, ctx: &RunContext<'_>) -> anyhow::Result<RunStatus> {
        let token = if self.config.needs_token {
            match ctx.usable_token().await? {
                Some(token) => Some(token),
                None => {
                    debug!(intention = %intention.id, "no usable token at point of use");
                    return Ok(RunStatus::Incomplete);
                }
            }
        } else {
            None
        };

        let path = self.command_path()?;
        let mut command = Command::new(&path);
        command
            .args(&self.config.args)
            .env("POOLSCHED_INTENTION_ID", intention.id.0.to_string())
            .env("POOLSCHED_USER_ID", intention.user_id.0.to_string())
            .env("POOLSCHED_KIND", intention.kind.as_str())
            .env("POOLSCHED_JOB_ID", ctx.job().id.0.to_string())
            .env("POOLSCHED_PARAMS", intention.params.to_string());
        if let Some(ref token) = token {
            command
                .env("POOLSCHED_TOKEN_ID", token.id.0.to_string())
                .env("POOLSCHED_TOKEN", token.secret.expose_secret());
        }

        debug!(intention = %intention.id, command = %path.display(), "running command");
        let output = command.output().await?;

        match output.status.code() {
            Some(0) => Ok(RunStatus::Done),
            Some(EXIT_INCOMPLETE) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let (Some(token), Some(reset)) = (token, parse_reset(&stdout)) {
                    ctx.exhaust_token(token.id, reset).await?;
                }
                Ok(RunStatus::Incomplete)
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                warn!(intention = %intention.id, ?code, "command failed");
                anyhow::bail!(
                    "{} exited with status {}: {}",
                    path.display(),
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    stderr
                )
            }
        }
    }

    fn follow_ups(&self, intention: &Intention) -> Vec<NewIntention> {
        self.config
            .follow_up
            .iter()
            .map(|kind| {
                NewIntention::new(intention.user_id, kind.clone()).params(intention.params.clone())
            })
            .collect()
    }
}

/// Find a `reset <timestamp>` line in command output.
fn parse_reset(stdout: &str) -> Option<DateTime<Utc>> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("reset ")?;
        DateTime::parse_from_rfc3339(rest.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reset_line() {
        let out = "fetched 30 pages\nreset 2026-01-01T00:00:00Z\n";
        let reset = parse_reset(out).unwrap();
        assert_eq!(reset.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn ignores_output_without_reset() {
        assert!(parse_reset("rate limited\n").is_none());
        assert!(parse_reset("reset soon\n").is_none());
    }

    #[test]
    fn config_defaults_to_token_gated() {
        let config: HandlerConfig =
            toml::from_str("kind = \"github.raw\"\ncommand = \"hooks/raw\"").unwrap();
        let handler = CommandHandler::new(config);
        assert!(handler.readiness().needs_token);
        assert!(handler.config.follow_up.is_none());
        assert!(handler.config.args.is_empty());
    }
}
