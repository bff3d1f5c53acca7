//! Configuration parsing and validation.
//!
//! Reads a TOML file describing the document database, the state file, and
//! the GitLab and Slack sources. Credentials are never read from the file;
//! they come from the environment, as do optional instance-list overrides.
//!
//! ```toml
//! [db]
//! path = "./data/knowledge.sqlite"
//!
//! [gitlab]
//! api_url = "https://gitlab.example.com/api/v4"
//! repos = ["group/project"]
//!
//! [slack]
//! channels = ["dev"]
//! days_back = 90
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use knowledge_sync_core::{AdmissionPolicy, AdmissionRules};
use serde::Deserialize;
use thiserror::Error;

pub const GITLAB_TOKEN_ENV: &str = "GITLAB_PERSONAL_ACCESS_TOKEN";
pub const SLACK_TOKEN_ENV: &str = "SLACK_BOT_TOKEN";
pub const GITLAB_REPOS_ENV: &str = "GITLAB_REPOS";
pub const SLACK_CHANNELS_ENV: &str = "SLACK_CHANNELS";
pub const GITLAB_API_URL_ENV: &str = "GITLAB_API_URL";

/// Upper bound for `slack.days_back` (a century).
pub const MAX_DAYS_BACK: u32 = 36_500;

/// Configuration problems detected before any instance is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{source_name} is configured but {var} is not set")]
    MissingCredential {
        source_name: &'static str,
        var: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub gitlab: Option<GitlabConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// Defaults to `.indexer-state.json` next to the database.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitlabConfig {
    #[serde(default = "default_gitlab_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub repos: Vec<String>,
    /// Where repositories are cloned. Defaults to `repos/` next to the database.
    pub clone_dir: Option<PathBuf>,
    /// Branch to follow. Defaults to each project's default branch.
    pub branch: Option<String>,
    #[serde(default = "default_gitlab_collection")]
    pub collection: String,
    #[serde(default = "default_commit_limit")]
    pub commit_limit: usize,
    #[serde(default = "default_merge_request_limit")]
    pub merge_request_limit: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    /// Per-kind admission overrides, layered over [`default_gitlab_filters`].
    #[serde(default)]
    pub filter: BTreeMap<String, AdmissionPolicy>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default = "default_slack_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default = "default_slack_collection")]
    pub collection: String,
    #[serde(default)]
    pub filter: AdmissionPolicy,
}

fn default_gitlab_api_url() -> String {
    "https://gitlab.com/api/v4".to_string()
}
fn default_gitlab_collection() -> String {
    "codebase_knowledge".to_string()
}
fn default_commit_limit() -> usize {
    500
}
fn default_merge_request_limit() -> usize {
    100
}
fn default_include_globs() -> Vec<String> {
    ["php", "js", "vue", "py", "md", "xml", "json"]
        .iter()
        .map(|ext| format!("**/*.{}", ext))
        .collect()
}

/// Per-kind admission defaults for repository units.
pub fn default_gitlab_filters() -> BTreeMap<String, AdmissionPolicy> {
    let code = AdmissionPolicy::new(100, 100_000).excluding(
        ["vendor", "node_modules", ".git", "var", "pub/static"]
            .iter()
            .map(|s| s.to_string()),
    );
    let mut filters = BTreeMap::new();
    filters.insert("code".to_string(), code);
    filters.insert("commit".to_string(), AdmissionPolicy::new(20, 100_000));
    filters.insert("merge_request".to_string(), AdmissionPolicy::new(30, 100_000));
    filters
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}
fn default_days_back() -> u32 {
    90
}
fn default_slack_collection() -> String {
    "slack_knowledge".to_string()
}

impl Config {
    /// Path of the JSON state file.
    pub fn state_path(&self) -> PathBuf {
        match &self.state.path {
            Some(path) => path.clone(),
            None => self.db_dir().join(".indexer-state.json"),
        }
    }

    fn db_dir(&self) -> PathBuf {
        self.db
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl GitlabConfig {
    pub fn clone_root(&self, config: &Config) -> PathBuf {
        self.clone_dir
            .clone()
            .unwrap_or_else(|| config.db_dir().join("repos"))
    }

    /// Admission rules keyed by unit kind, configured kinds replacing the defaults.
    pub fn admission(&self) -> AdmissionRules {
        let mut filters = default_gitlab_filters();
        filters.extend(self.filter.clone());
        filters
            .iter()
            .fold(AdmissionRules::default(), |rules, (kind, policy)| {
                rules.with(kind, policy.clone())
            })
    }
}

impl SlackConfig {
    pub fn admission(&self) -> AdmissionRules {
        AdmissionRules::uniform(self.filter.clone())
    }
}

/// Read a credential from the environment, treating blank values as absent.
pub fn credential(source_name: &'static str, var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingCredential { source_name, var })
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(gitlab) = config.gitlab.as_mut() {
        if let Some(repos) = env_list(GITLAB_REPOS_ENV) {
            gitlab.repos = repos;
        }
        if let Ok(url) = std::env::var(GITLAB_API_URL_ENV) {
            if !url.trim().is_empty() {
                gitlab.api_url = url.trim().to_string();
            }
        }
    }
    if let Some(slack) = config.slack.as_mut() {
        if let Some(channels) = env_list(SLACK_CHANNELS_ENV) {
            slack.channels = channels;
        }
    }
}

fn env_list(var: &str) -> Option<Vec<String>> {
    let raw = std::env::var(var).ok()?;
    let items = split_list(&raw);
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if let Some(gitlab) = &config.gitlab {
        if reqwest::Url::parse(&gitlab.api_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "gitlab.api_url is not a URL: '{}'",
                gitlab.api_url
            )));
        }
        if gitlab.commit_limit == 0 {
            return Err(ConfigError::Invalid("gitlab.commit_limit must be > 0".into()));
        }
        for kind in gitlab.filter.keys() {
            if !matches!(kind.as_str(), "code" | "commit" | "merge_request") {
                return Err(ConfigError::Invalid(format!(
                    "unknown gitlab.filter kind '{}'. Must be code, commit, or merge_request.",
                    kind
                )));
            }
        }
        for (kind, policy) in &gitlab.filter {
            check_policy(&format!("gitlab.filter.{}", kind), policy)?;
        }
        if let Err(e) = crate::connector_gitlab::build_globset(&gitlab.include_globs) {
            return Err(ConfigError::Invalid(format!("gitlab.include_globs: {}", e)));
        }
    }

    if let Some(slack) = &config.slack {
        if reqwest::Url::parse(&slack.api_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "slack.api_url is not a URL: '{}'",
                slack.api_url
            )));
        }
        if slack.days_back == 0 || slack.days_back > MAX_DAYS_BACK {
            return Err(ConfigError::Invalid(format!(
                "slack.days_back must be between 1 and {}",
                MAX_DAYS_BACK
            )));
        }
        check_policy("slack.filter", &slack.filter)?;
    }

    Ok(())
}

fn check_policy(name: &str, policy: &AdmissionPolicy) -> Result<(), ConfigError> {
    if policy.min_len > policy.max_len {
        return Err(ConfigError::Invalid(format!(
            "{}: min_len ({}) exceeds max_len ({})",
            name, policy.min_len, policy.max_len
        )));
    }
    Ok(())
}
