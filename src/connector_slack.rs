//! Slack channel connector.
//!
//! Instances are channel names. Resolution lists the conversations the bot
//! can see; fetching pages through `conversations.history` from the stored
//! watermark (or `days_back` days ago on a first run).
//!
//! Slack identifies messages by `ts`, a `"<secs>.<micros>"` string. The
//! watermark stores it as integer microseconds so it compares exactly;
//! [`parse_ts`] and [`format_ts`] convert between the two.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use knowledge_sync_core::{
    ChangeSet, ConnectorError, ContentUnit, Delta, InstanceHandle, SourceConnector, StateScope,
    SyncWatermark, UnitKey, WatermarkKind,
};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::SlackConfig;

const SOURCE: &str = "slack";
const HISTORY_PAGE_SIZE: &str = "200";
const LIST_PAGE_SIZE: &str = "1000";

pub struct SlackConnector {
    client: reqwest::Client,
    api_url: Url,
    token: String,
    days_back: u32,
}

impl SlackConnector {
    pub fn new(slack: &SlackConfig, token: String) -> Result<Self> {
        let api_url = Url::parse(&slack.api_url)
            .with_context(|| format!("Invalid slack.api_url: {}", slack.api_url))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("knowledge-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url,
            token,
            days_back: slack.days_back,
        })
    }

    /// Call a Web API method, turning `ok: false` into a transient error.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ConnectorError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConnectorError::transient("slack.api_url cannot be a base URL"))?
            .pop_if_empty()
            .push(method);

        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await
            .map_err(ConnectorError::transient)?;
        if !resp.status().is_success() {
            return Err(ConnectorError::Transient(format!(
                "{} returned {}",
                method,
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await.map_err(ConnectorError::transient)?;
        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let error = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(ConnectorError::Transient(format!("{} failed: {}", method, error)));
        }
        serde_json::from_value(body).map_err(ConnectorError::transient)
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, ConnectorError> {
        let mut channels = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut params = vec![
                ("types", "public_channel,private_channel"),
                ("exclude_archived", "true"),
                ("limit", LIST_PAGE_SIZE),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }
            let page: ChannelPage = self.call("conversations.list", &params).await?;
            channels.extend(page.channels);
            match page.response_metadata.and_then(|m| m.next_cursor) {
                Some(next) if !next.is_empty() => cursor = next,
                _ => break,
            }
        }
        Ok(channels)
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        oldest: &str,
    ) -> Result<Vec<Message>, ConnectorError> {
        let mut messages = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut params = vec![
                ("channel", channel_id),
                ("oldest", oldest),
                ("limit", HISTORY_PAGE_SIZE),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }
            let page: HistoryPage = self.call("conversations.history", &params).await?;
            debug!(count = page.messages.len(), "history page");
            messages.extend(page.messages);
            if !page.has_more {
                break;
            }
            match page.response_metadata.and_then(|m| m.next_cursor) {
                Some(next) if !next.is_empty() => cursor = next,
                _ => break,
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl SourceConnector for SlackConnector {
    fn scope(&self) -> StateScope {
        StateScope::new(SOURCE, "channels")
    }

    fn watermark_kind(&self) -> WatermarkKind {
        WatermarkKind::Timestamp
    }

    async fn resolve_instance(&self, descriptor: &str) -> Result<InstanceHandle, ConnectorError> {
        let name = descriptor.trim_start_matches('#');
        let channels = self.list_channels().await?;
        match find_channel(&channels, name) {
            ChannelMatch::Exact(channel) => Ok(InstanceHandle::new(name, channel.id.as_str())),
            ChannelMatch::CaseMismatch(actual) => Err(ConnectorError::not_found(
                descriptor,
                format!("no channel named '{}'; did you mean '{}'?", name, actual),
            )),
            ChannelMatch::Missing => Err(ConnectorError::not_found(
                descriptor,
                "channel not found, or the bot is not a member",
            )),
        }
    }

    async fn fetch_delta(
        &self,
        handle: &InstanceHandle,
        watermark: Option<&SyncWatermark>,
    ) -> Result<Delta, ConnectorError> {
        let oldest_micros = match watermark {
            Some(SyncWatermark::Timestamp(micros)) => *micros,
            Some(other) => {
                return Err(ConnectorError::Transient(format!(
                    "unexpected watermark {} for a channel",
                    other
                )))
            }
            None => history_start(Utc::now(), self.days_back)?,
        };
        let oldest = format_ts(oldest_micros);

        let messages = self.fetch_history(&handle.remote_id, &oldest).await?;
        let newest = messages.iter().filter_map(|m| parse_ts(&m.ts)).max();
        let units: Vec<ContentUnit> = messages
            .iter()
            .map(|m| message_unit(&handle.key, m))
            .collect();

        info!(messages = units.len(), oldest = %oldest, "channel history fetched");

        let new_watermark = newest.map(SyncWatermark::Timestamp);
        Ok(match watermark {
            None => Delta::full(units, new_watermark),
            Some(_) => Delta::incremental(
                ChangeSet {
                    added_or_modified: units,
                    removed: Default::default(),
                },
                new_watermark,
            ),
        })
    }
}

// ─── API payloads ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ChannelPage {
    #[serde(default)]
    channels: Vec<Channel>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    has_more: bool,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub ts: String,
    #[serde(default)]
    pub text: String,
    pub user: Option<String>,
    pub subtype: Option<String>,
    pub bot_id: Option<String>,
    pub thread_ts: Option<String>,
}

// ─── Mapping ────────────────────────────────────────────────────────

pub enum ChannelMatch<'a> {
    Exact(&'a Channel),
    /// Only a channel differing in case exists; carries its real name.
    CaseMismatch(&'a str),
    Missing,
}

pub fn find_channel<'a>(channels: &'a [Channel], name: &str) -> ChannelMatch<'a> {
    if let Some(channel) = channels.iter().find(|c| c.name == name) {
        return ChannelMatch::Exact(channel);
    }
    match channels.iter().find(|c| c.name.eq_ignore_ascii_case(name)) {
        Some(channel) => ChannelMatch::CaseMismatch(&channel.name),
        None => ChannelMatch::Missing,
    }
}

pub fn message_unit(channel: &str, msg: &Message) -> ContentUnit {
    let date = parse_ts(&msg.ts)
        .and_then(|micros| {
            DateTime::<Utc>::from_timestamp(
                micros.div_euclid(1_000_000),
                (micros.rem_euclid(1_000_000) * 1_000) as u32,
            )
        })
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
    ContentUnit::new(UnitKey::new("message", channel, msg.ts.as_str()), msg.text.as_str())
        .automated(msg.subtype.is_some() || msg.bot_id.is_some())
        .with_meta("source", SOURCE)
        .with_meta("channel", channel)
        .with_meta("timestamp", msg.ts.as_str())
        .with_meta("user", msg.user.as_deref().unwrap_or("unknown"))
        .with_meta("thread", if msg.thread_ts.is_some() { "yes" } else { "no" })
        .with_meta("date", date)
}

/// Microseconds of `now` minus `days_back` days, where a first run starts reading.
pub fn history_start(now: DateTime<Utc>, days_back: u32) -> Result<i64, ConnectorError> {
    now.checked_sub_signed(chrono::Duration::days(i64::from(days_back)))
        .map(|since| since.timestamp_micros())
        .ok_or_else(|| {
            ConnectorError::Transient(format!("days_back {} reaches before the calendar", days_back))
        })
}

/// Parse a Slack `ts` (`"1700000000.000100"`) into microseconds.
///
/// Fractions longer than six digits are truncated; shorter ones are padded.
pub fn parse_ts(ts: &str) -> Option<i64> {
    let (secs, frac) = match ts.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (ts, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut digits: String = frac.chars().take(6).collect();
    while digits.len() < 6 {
        digits.push('0');
    }
    let micros: i64 = digits.parse().ok()?;
    secs.checked_mul(1_000_000)?.checked_add(micros)
}

/// Format microseconds as a Slack `ts`.
pub fn format_ts(micros: i64) -> String {
    format!(
        "{}.{:06}",
        micros.div_euclid(1_000_000),
        micros.rem_euclid(1_000_000)
    )
}
