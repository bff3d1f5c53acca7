//! GitLab repository connector.
//!
//! Each instance is a project path such as `group/project`. The connector
//! keeps a local clone under the configured clone directory and reports
//! three kinds of units:
//!
//! | Kind | Natural key | Source |
//! |------|-------------|--------|
//! | `code` | repository-relative path | files tracked at HEAD matching `include_globs` |
//! | `commit` | full sha | `git log`, capped at `commit_limit` |
//! | `merge_request` | MR iid | GitLab API, merged MRs |
//!
//! The watermark is the HEAD sha of the followed branch. Incremental runs
//! diff the stored sha against the new HEAD; if the stored sha is gone from
//! history (force push, rewritten branch) the run falls back to a full
//! listing flagged as a rescan.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use knowledge_sync_core::{
    ChangeSet, ConnectorError, ContentUnit, Delta, InstanceHandle, SourceConnector, StateScope,
    SyncWatermark, UnitKey, WatermarkKind,
};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{Config, GitlabConfig};

const SOURCE: &str = "gitlab";

/// Field and record separators for `git log` output.
const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

pub struct GitlabConnector {
    client: reqwest::Client,
    api_url: Url,
    token: String,
    clone_root: PathBuf,
    branch: Option<String>,
    commit_limit: usize,
    merge_request_limit: usize,
    include: GlobSet,
}

impl GitlabConnector {
    pub fn new(config: &Config, gitlab: &GitlabConfig, token: String) -> Result<Self> {
        let api_url = Url::parse(&gitlab.api_url)
            .with_context(|| format!("Invalid gitlab.api_url: {}", gitlab.api_url))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("knowledge-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url,
            token,
            clone_root: gitlab.clone_root(config),
            branch: gitlab.branch.clone(),
            commit_limit: gitlab.commit_limit,
            merge_request_limit: gitlab.merge_request_limit,
            include: build_globset(&gitlab.include_globs)?,
        })
    }

    /// API URL with `segments` appended, each percent-encoded as one segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ConnectorError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConnectorError::transient("gitlab.api_url cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch_merge_requests(
        &self,
        project_id: &str,
    ) -> Result<Vec<MergeRequest>, ConnectorError> {
        let per_page = self.merge_request_limit.clamp(1, 100);
        let mut collected = Vec::new();
        let mut page = 1usize;

        while collected.len() < self.merge_request_limit {
            let url = self.endpoint(&["projects", project_id, "merge_requests"])?;
            let resp = self
                .client
                .get(url)
                .header("PRIVATE-TOKEN", &self.token)
                .query(&[
                    ("state", "merged"),
                    ("order_by", "updated_at"),
                    ("per_page", &per_page.to_string()),
                    ("page", &page.to_string()),
                ])
                .send()
                .await
                .map_err(ConnectorError::transient)?;

            if !resp.status().is_success() {
                return Err(ConnectorError::Transient(format!(
                    "merge request listing returned {}",
                    resp.status()
                )));
            }
            let batch: Vec<MergeRequest> = resp.json().await.map_err(ConnectorError::transient)?;
            let exhausted = batch.len() < per_page;
            collected.extend(batch);
            if exhausted {
                break;
            }
            page += 1;
        }

        collected.truncate(self.merge_request_limit);
        Ok(collected)
    }

    fn checkout(&self, handle: &InstanceHandle) -> Result<Checkout, ConnectorError> {
        let branch = handle
            .default_ref
            .clone()
            .ok_or_else(|| ConnectorError::transient("project has no branch to follow"))?;
        Ok(Checkout {
            dir: self.clone_root.join(&handle.key),
            url: clone_url(&self.api_url, &handle.key, &self.token)
                .map_err(ConnectorError::transient)?,
            branch,
            token: self.token.clone(),
        })
    }
}

#[async_trait]
impl SourceConnector for GitlabConnector {
    fn scope(&self) -> StateScope {
        StateScope::new(SOURCE, "repos")
    }

    fn watermark_kind(&self) -> WatermarkKind {
        WatermarkKind::Commit
    }

    fn tracked_source_type(&self) -> Option<&str> {
        Some("code")
    }

    async fn resolve_instance(&self, descriptor: &str) -> Result<InstanceHandle, ConnectorError> {
        let url = self.endpoint(&["projects", descriptor])?;
        let resp = self
            .client
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(ConnectorError::transient)?;

        match resp.status() {
            StatusCode::NOT_FOUND => {
                let reason = resp
                    .json::<ApiMessage>()
                    .await
                    .ok()
                    .and_then(|m| m.message)
                    .unwrap_or_else(|| "404 Project Not Found".to_string());
                return Err(ConnectorError::not_found(descriptor, reason));
            }
            status if !status.is_success() => {
                return Err(ConnectorError::Transient(format!(
                    "project lookup returned {}",
                    status
                )));
            }
            _ => {}
        }

        let project: Project = resp.json().await.map_err(ConnectorError::transient)?;
        // Lookups ignore case and follow renames; only the canonical path may key state and ids.
        if project.path_with_namespace != descriptor {
            return Err(ConnectorError::not_found(
                descriptor,
                format!("did you mean '{}'?", project.path_with_namespace),
            ));
        }
        let mut handle = InstanceHandle::new(descriptor, project.id.to_string());
        handle.web_url = project.web_url;
        handle.default_ref = self.branch.clone().or(project.default_branch);
        Ok(handle)
    }

    async fn fetch_delta(
        &self,
        handle: &InstanceHandle,
        watermark: Option<&SyncWatermark>,
    ) -> Result<Delta, ConnectorError> {
        let prev = match watermark {
            Some(SyncWatermark::Commit(sha)) => Some(sha.clone()),
            Some(other) => {
                return Err(ConnectorError::Transient(format!(
                    "unexpected watermark {} for a repository",
                    other
                )))
            }
            None => None,
        };

        let checkout = self.checkout(handle)?;
        let include = self.include.clone();
        let commit_limit = self.commit_limit;
        let scan = tokio::task::spawn_blocking(move || {
            scan_repository(&checkout, prev.as_deref(), &include, commit_limit)
        })
        .await
        .map_err(ConnectorError::transient)?
        .map_err(ConnectorError::transient)?;

        let repo = handle.key.as_str();
        let web_url = handle.web_url.as_deref();
        let mut units: Vec<ContentUnit> = scan
            .files
            .iter()
            .map(|(path, text)| code_unit(repo, web_url, &scan.head, path, text))
            .collect();
        units.extend(scan.commits.iter().map(|c| commit_unit(repo, c)));

        let mr_warning = match self.fetch_merge_requests(&handle.remote_id).await {
            Ok(mrs) => {
                units.extend(mrs.iter().map(|mr| merge_request_unit(repo, mr)));
                None
            }
            Err(e) => Some(format!("merge requests skipped: {}", e)),
        };

        info!(
            files = scan.files.len(),
            deleted = scan.deleted.len(),
            commits = scan.commits.len(),
            head = %scan.head,
            mode = ?scan.mode,
            "repository scanned"
        );

        let new_watermark = Some(SyncWatermark::Commit(scan.head));
        let delta = match scan.mode {
            ScanMode::Full => Delta::full(units, new_watermark),
            ScanMode::Rescan => Delta::rescan(units, new_watermark),
            ScanMode::Incremental => Delta::incremental(
                ChangeSet {
                    added_or_modified: units,
                    removed: scan
                        .deleted
                        .into_iter()
                        .map(|path| UnitKey::new("code", repo, path))
                        .collect(),
                },
                new_watermark,
            ),
        };
        Ok(match mr_warning {
            Some(warning) => delta.with_warning(warning),
            None => delta,
        })
    }
}

// ─── API payloads ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Project {
    id: u64,
    path_with_namespace: String,
    web_url: Option<String>,
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub iid: u64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<MergeRequestAuthor>,
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequestAuthor {
    pub username: String,
}

// ─── Unit mapping ───────────────────────────────────────────────────

pub fn code_unit(
    repo: &str,
    web_url: Option<&str>,
    head: &str,
    path: &str,
    text: &str,
) -> ContentUnit {
    let language = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut unit = ContentUnit::new(UnitKey::new("code", repo, path), text)
        .at_path(path)
        .with_meta("type", "code")
        .with_meta("source", SOURCE)
        .with_meta("repo", repo)
        .with_meta("file", path)
        .with_meta("language", language);
    if let Some(base) = web_url {
        unit = unit.with_meta(
            "url",
            format!("{}/-/blob/{}/{}", base.trim_end_matches('/'), head, path),
        );
    }
    unit
}

pub fn commit_unit(repo: &str, commit: &CommitEntry) -> ContentUnit {
    let message = commit.message.trim();
    let automated = commit.parents > 1 || message.starts_with("Merge");
    ContentUnit::new(UnitKey::new("commit", repo, &commit.sha), message)
        .automated(automated)
        .with_meta("type", "commit")
        .with_meta("source", SOURCE)
        .with_meta("repo", repo)
        .with_meta("sha", commit.sha.chars().take(8).collect::<String>())
        .with_meta("author", commit.author.as_str())
        .with_meta("date", commit.date.as_str())
}

pub fn merge_request_unit(repo: &str, mr: &MergeRequest) -> ContentUnit {
    let text = format!(
        "{}\n\n{}",
        mr.title,
        mr.description.as_deref().unwrap_or_default()
    );
    let mut unit = ContentUnit::new(UnitKey::new("merge_request", repo, mr.iid.to_string()), text)
        .with_meta("type", "merge_request")
        .with_meta("source", SOURCE)
        .with_meta("repo", repo)
        .with_meta("mr_id", mr.iid as i64)
        .with_meta(
            "author",
            mr.author
                .as_ref()
                .map(|a| a.username.as_str())
                .unwrap_or("unknown"),
        )
        .with_meta("merged_at", mr.merged_at.clone().unwrap_or_default());
    if let Some(url) = &mr.web_url {
        unit = unit.with_meta("web_url", url.as_str());
    }
    unit
}

// ─── Local clone ────────────────────────────────────────────────────

struct Checkout {
    dir: PathBuf,
    url: String,
    branch: String,
    token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    Full,
    Incremental,
    Rescan,
}

struct RepoScan {
    head: String,
    mode: ScanMode,
    /// `(relative path, contents)` of files to upsert.
    files: Vec<(String, String)>,
    deleted: Vec<String>,
    commits: Vec<CommitEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub sha: String,
    pub parents: usize,
    pub author: String,
    pub date: String,
    pub message: String,
}

/// One path-level change from `git diff --name-status -z`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Upserted(String),
    Deleted(String),
}

fn scan_repository(
    checkout: &Checkout,
    prev: Option<&str>,
    include: &GlobSet,
    commit_limit: usize,
) -> Result<RepoScan> {
    sync_clone(checkout)?;
    let dir = checkout.dir.as_path();
    let head = git(dir, &["rev-parse", "HEAD"], &checkout.token)?
        .trim()
        .to_string();

    let mode = match prev {
        None => ScanMode::Full,
        Some(sha) if commit_exists(dir, sha) => ScanMode::Incremental,
        Some(sha) => {
            warn!(sha, "stored commit is no longer in history");
            ScanMode::Rescan
        }
    };

    if let (ScanMode::Incremental, Some(prev)) = (mode, prev) {
        let diff = git(
            dir,
            &["diff", "--name-status", "-z", "--no-renames", prev, &head],
            &checkout.token,
        );
        match diff {
            Ok(raw) => {
                let mut files = Vec::new();
                let mut deleted = Vec::new();
                for change in parse_name_status(&raw) {
                    match change {
                        FileChange::Deleted(path) if include.is_match(&path) => deleted.push(path),
                        FileChange::Upserted(path) if include.is_match(&path) => {
                            if let Some(text) = read_text(&dir.join(&path)) {
                                files.push((path, text));
                            }
                        }
                        _ => {}
                    }
                }
                let range = format!("{}..{}", prev, head);
                let commits = log_commits(dir, &range, commit_limit, &checkout.token)?;
                return Ok(RepoScan {
                    head,
                    mode,
                    files,
                    deleted,
                    commits,
                });
            }
            Err(e) => {
                warn!(error = %e, "diff against stored commit failed; rescanning");
                return full_scan(checkout, head, ScanMode::Rescan, include, commit_limit);
            }
        }
    }

    full_scan(checkout, head, mode, include, commit_limit)
}

fn full_scan(
    checkout: &Checkout,
    head: String,
    mode: ScanMode,
    include: &GlobSet,
    commit_limit: usize,
) -> Result<RepoScan> {
    let dir = checkout.dir.as_path();
    let tracked = git(dir, &["ls-files", "-z"], &checkout.token)?;
    let mut files = Vec::new();
    for relative in tracked.split('\0').filter(|p| !p.is_empty()) {
        if !include.is_match(relative) {
            continue;
        }
        if let Some(text) = read_text(&dir.join(relative)) {
            files.push((relative.to_string(), text));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let commits = log_commits(dir, &head, commit_limit, &checkout.token)?;
    Ok(RepoScan {
        head,
        mode,
        files,
        deleted: Vec::new(),
        commits,
    })
}

fn sync_clone(checkout: &Checkout) -> Result<()> {
    if checkout.dir.join(".git").exists() {
        debug!(dir = %checkout.dir.display(), "fetching");
        git(
            &checkout.dir,
            &["fetch", "origin", &checkout.branch],
            &checkout.token,
        )?;
        let remote_ref = format!("origin/{}", checkout.branch);
        git(
            &checkout.dir,
            &["reset", "--hard", &remote_ref],
            &checkout.token,
        )?;
        return Ok(());
    }

    debug!(dir = %checkout.dir.display(), "cloning");
    if let Some(parent) = checkout.dir.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create clone directory: {}", parent.display()))?;
    }
    let output = Command::new("git")
        .args(["clone", "--branch", &checkout.branch, "--single-branch"])
        .arg(&checkout.url)
        .arg(&checkout.dir)
        .output()
        .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone failed: {}", redact(stderr.trim(), &checkout.token));
    }
    Ok(())
}

fn git(dir: &Path, args: &[&str], token: &str) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("Failed to execute 'git {}'", args[0]))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args[0], redact(stderr.trim(), token));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn commit_exists(dir: &Path, sha: &str) -> bool {
    Command::new("git")
        .args(["cat-file", "-e", &format!("{}^{{commit}}", sha)])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn log_commits(dir: &Path, range: &str, limit: usize, token: &str) -> Result<Vec<CommitEntry>> {
    let format = format!(
        "--format=%H{f}%P{f}%an{f}%cI{f}%B{r}",
        f = "%x1f",
        r = "%x1e"
    );
    let max_count = format!("--max-count={}", limit);
    let raw = git(dir, &["log", &max_count, &format, range], token)?;
    Ok(parse_log(&raw))
}

/// Parse `git log` output written with [`FIELD_SEP`] / [`RECORD_SEP`].
pub fn parse_log(raw: &str) -> Vec<CommitEntry> {
    raw.split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            if record.trim().is_empty() {
                return None;
            }
            let mut fields = record.splitn(5, FIELD_SEP);
            let sha = fields.next()?.trim().to_string();
            let parents = fields.next()?.split_whitespace().count();
            let author = fields.next()?.to_string();
            let date = fields.next()?.to_string();
            let message = fields.next().unwrap_or_default().trim().to_string();
            Some(CommitEntry {
                sha,
                parents,
                author,
                date,
                message,
            })
        })
        .collect()
}

/// Parse `git diff --name-status -z` output. Renames and copies are split
/// so the old path is removed and the new one upserted.
pub fn parse_name_status(raw: &str) -> Vec<FileChange> {
    let mut tokens = raw.split('\0').filter(|t| !t.is_empty());
    let mut changes = Vec::new();
    while let Some(status) = tokens.next() {
        match status.chars().next() {
            Some('R') => {
                if let (Some(from), Some(to)) = (tokens.next(), tokens.next()) {
                    changes.push(FileChange::Deleted(from.to_string()));
                    changes.push(FileChange::Upserted(to.to_string()));
                }
            }
            Some('C') => {
                if let (Some(_), Some(to)) = (tokens.next(), tokens.next()) {
                    changes.push(FileChange::Upserted(to.to_string()));
                }
            }
            Some('D') => {
                if let Some(path) = tokens.next() {
                    changes.push(FileChange::Deleted(path.to_string()));
                }
            }
            Some(_) => {
                if let Some(path) = tokens.next() {
                    changes.push(FileChange::Upserted(path.to_string()));
                }
            }
            None => {}
        }
    }
    changes
}

fn read_text(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipping unreadable file");
            None
        }
    }
}

/// `https://oauth2:<token>@host[/prefix]/<repo>.git`, derived from the API URL.
pub fn clone_url(api_url: &Url, repo: &str, token: &str) -> Result<String> {
    let mut url = api_url.clone();
    let prefix = api_url
        .path()
        .trim_end_matches('/')
        .trim_end_matches("/api/v4")
        .to_string();
    url.set_path(&format!("{}/{}.git", prefix, repo.trim_matches('/')));
    url.set_query(None);
    url.set_fragment(None);
    if url.set_username("oauth2").is_err() || url.set_password(Some(token)).is_err() {
        bail!("cannot embed credentials in {}", api_url);
    }
    Ok(url.to_string())
}

fn redact(message: &str, token: &str) -> String {
    if token.is_empty() {
        message.to_string()
    } else {
        message.replace(token, "***")
    }
}

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
