//! Sync orchestration.
//!
//! Builds one [`SyncJob`] per selected source (GitLab, Slack), each writing
//! into its own collection of the SQLite database, and runs them through a
//! single [`SyncEngine`] pass so the state file is loaded and saved once.
//! Credentials are checked for every selected source before any instance
//! is processed.

use std::sync::Arc;

use anyhow::{bail, Result};
use knowledge_sync_core::{InstanceStatus, RunSummary, SyncEngine, SyncJob};

use crate::config::{self, Config, GITLAB_TOKEN_ENV, SLACK_TOKEN_ENV};
use crate::connector_gitlab::GitlabConnector;
use crate::connector_slack::SlackConnector;
use crate::db;
use crate::migrate;
use crate::sqlite_sink::SqliteSink;
use crate::state_file::JsonStateStore;

/// Which sources a `sync` invocation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    All,
    Gitlab,
    Slack,
}

impl SyncTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "all" => Ok(SyncTarget::All),
            "gitlab" => Ok(SyncTarget::Gitlab),
            "slack" => Ok(SyncTarget::Slack),
            other => bail!(
                "Unknown source: '{}'. Available: all, gitlab, slack",
                other
            ),
        }
    }

    fn includes_gitlab(self) -> bool {
        matches!(self, SyncTarget::All | SyncTarget::Gitlab)
    }

    fn includes_slack(self) -> bool {
        matches!(self, SyncTarget::All | SyncTarget::Slack)
    }
}

pub async fn run_sync(config: &Config, target: &str, full_reindex: bool) -> Result<()> {
    let target = SyncTarget::parse(target)?;
    let pool = db::connect(config).await?;
    migrate::create_schema(&pool).await?;

    let jobs = build_jobs(config, target, &pool)?;
    let engine = SyncEngine::new(JsonStateStore::new(config.state_path()));
    let summary = engine.run(&jobs, full_reindex).await;
    pool.close().await;

    print_summary(target, &summary);

    if let Some(err) = &summary.state_error {
        bail!("sync state was not saved: {}", err);
    }
    Ok(())
}

fn build_jobs(config: &Config, target: SyncTarget, pool: &sqlx::SqlitePool) -> Result<Vec<SyncJob>> {
    let mut jobs = Vec::new();

    if target.includes_gitlab() {
        match &config.gitlab {
            Some(gitlab) => {
                let token = config::credential("gitlab", GITLAB_TOKEN_ENV)?;
                let connector = GitlabConnector::new(config, gitlab, token)?;
                let sink = SqliteSink::new(pool.clone(), gitlab.collection.clone());
                jobs.push(
                    SyncJob::new(Arc::new(connector), Arc::new(sink), gitlab.repos.clone())
                        .with_admission(gitlab.admission()),
                );
            }
            None if target == SyncTarget::Gitlab => bail!("gitlab is not configured"),
            None => {}
        }
    }

    if target.includes_slack() {
        match &config.slack {
            Some(slack) => {
                let token = config::credential("slack", SLACK_TOKEN_ENV)?;
                let connector = SlackConnector::new(slack, token)?;
                let sink = SqliteSink::new(pool.clone(), slack.collection.clone());
                jobs.push(
                    SyncJob::new(Arc::new(connector), Arc::new(sink), slack.channels.clone())
                        .with_admission(slack.admission()),
                );
            }
            None if target == SyncTarget::Slack => bail!("slack is not configured"),
            None => {}
        }
    }

    if jobs.is_empty() {
        bail!("no sources configured; add a [gitlab] or [slack] section");
    }
    Ok(jobs)
}

fn print_summary(target: SyncTarget, summary: &RunSummary) {
    let mode = if summary.full_reindex {
        "full reindex"
    } else {
        "incremental"
    };
    println!("sync {} ({})", target_name(target), mode);

    for outcome in &summary.instances {
        let c = &outcome.counts;
        match &outcome.status {
            InstanceStatus::Persisted {
                watermark,
                rescanned,
            } => {
                let watermark = watermark
                    .as_ref()
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {}/{}: added {}, skipped {}, removed {}, failed {}, watermark {}{}",
                    outcome.source,
                    outcome.instance,
                    c.added,
                    c.skipped,
                    c.removed,
                    c.failed,
                    watermark,
                    if *rescanned { " (rescanned)" } else { "" }
                );
                for warning in &outcome.warnings {
                    println!("    warning: {}", warning);
                }
            }
            InstanceStatus::Failed { phase, error } => {
                println!(
                    "  {}/{}: FAILED while {:?}: {}",
                    outcome.source, outcome.instance, phase, error
                );
            }
        }
    }

    let totals = summary.totals();
    println!(
        "  total: added {}, skipped {}, removed {}, failed {}",
        totals.added, totals.skipped, totals.removed, totals.failed
    );
    println!("{}", completion_line(summary));
}

fn completion_line(summary: &RunSummary) -> String {
    match (summary.failed_instances(), summary.warnings()) {
        (0, 0) => "ok".to_string(),
        (0, warnings) => format!("done with {} warning(s)", warnings),
        (failed, 0) => format!("done with {} failed instance(s)", failed),
        (failed, warnings) => format!(
            "done with {} failed instance(s) and {} warning(s)",
            failed, warnings
        ),
    }
}

fn target_name(target: SyncTarget) -> &'static str {
    match target {
        SyncTarget::All => "all",
        SyncTarget::Gitlab => "gitlab",
        SyncTarget::Slack => "slack",
    }
}
