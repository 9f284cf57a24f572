use std::path::Path;

use anyhow::{Context, Result};
use jobfeed_decode::PayloadFormat;
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedConfig>,
}

impl FeedRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|feed| feed.enabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub feed_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub url: String,
    /// Overrides the response's `Content-Type` when the publisher mislabels it.
    #[serde(default)]
    pub format: Option<PayloadFormat>,
}

pub async fn load_feed_registry(path: &Path) -> Result<FeedRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
