//! Runtime configuration: the line-group table and environment settings.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::reconcile::StopTimePolicy;

/// Line group probed by the status check when none is given.
pub const DEFAULT_LINE_GROUP: &str = "1-2-3";

const NYCT_FEED_BASE: &str = "https://api-endpoint.mta.info/Dataservice/mtagtfsfeeds/nyct%2F";

/// Maps line-group names to the feed URL that serves them.
///
/// Loaded from a JSON object on disk:
/// ```json
/// {
///   "A-C-E": "https://example.org/feeds/ace",
///   "L": "https://example.org/feeds/l"
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LineGroups {
    entries: BTreeMap<String, String>,
}

impl LineGroups {
    /// The New York City subway feeds.
    pub fn nyc_subway() -> Self {
        let feeds = [
            ("1-2-3", "gtfs"),
            ("4-5-6", "gtfs"),
            ("7", "gtfs"),
            ("A-C-E", "gtfs-ace"),
            ("B-D-F-M", "gtfs-bdfm"),
            ("G", "gtfs-g"),
            ("J-Z", "gtfs-jz"),
            ("L", "gtfs-l"),
            ("N-Q-R-W", "gtfs-nqrw"),
            ("S", "gtfs-si"),
        ];

        Self::from_entries(
            feeds
                .into_iter()
                .map(|(group, path)| (group.to_string(), format!("{NYCT_FEED_BASE}{path}"))),
        )
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Loads the table from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read line groups from '{path}'"))?;
        let entries: BTreeMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("'{path}' is not a JSON object of line group URLs"))?;
        Ok(Self { entries })
    }

    /// Returns the feed URL for `line_group`, if one is configured.
    pub fn url(&self, line_group: &str) -> Option<&str> {
        self.entries.get(line_group).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over all `(line_group, url)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Settings read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub database_url: String,
    pub line_groups_path: Option<String>,
    pub fetch_timeout: Duration,
    pub reconcile_timeout: Duration,
    pub stop_time_policy: StopTimePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://subway_feed.db".to_string(),
            line_groups_path: None,
            fetch_timeout: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(30),
            stop_time_policy: StopTimePolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(url) = lookup("DATABASE_URL") {
            settings.database_url = url;
        }
        settings.line_groups_path = lookup("LINE_GROUPS_PATH");
        if let Some(secs) = lookup("FETCH_TIMEOUT_SECS") {
            settings.fetch_timeout = parse_secs("FETCH_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("RECONCILE_TIMEOUT_SECS") {
            settings.reconcile_timeout = parse_secs("RECONCILE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(policy) = lookup("STOP_TIME_POLICY") {
            settings.stop_time_policy = policy
                .parse::<StopTimePolicy>()
                .map_err(|e| anyhow::anyhow!("STOP_TIME_POLICY: {e}"))?;
        }

        Ok(settings)
    }

    /// The configured line-group table, or the NYC subway defaults.
    pub fn line_groups(&self) -> Result<LineGroups> {
        match &self.line_groups_path {
            Some(path) => LineGroups::load(path),
            None => Ok(LineGroups::nyc_subway()),
        }
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got '{value}'"))?;
    Ok(Duration::from_secs(secs))
}
