//! Subscription fetcher with on-disk fallback

use super::{decode_body, filter_candidates, CandidateOrigin, CandidateSource, SubscriptionInfo};
use crate::common::FetchError;
use crate::config::Settings;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const USERINFO_HEADER: &str = "subscription-userinfo";

/// Fetches the subscription over HTTP and keeps the last good copy on disk
pub struct SubscriptionFetcher {
    url: String,
    cache_path: PathBuf,
    timeout: Duration,
}

impl SubscriptionFetcher {
    pub fn new(url: impl Into<String>, cache_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        SubscriptionFetcher {
            url: url.into(),
            cache_path: cache_path.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.subscription_url.clone(),
            settings.cache_path(),
            settings.fetch_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Fetch and decode the subscription body
    pub async fn fetch_remote(&self) -> Result<String, FetchError> {
        if self.url.is_empty() {
            return Err(FetchError::Network("no subscription url configured".into()));
        }

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;

        let resp = client.get(&self.url).send().await?.error_for_status()?;

        if let Some(info) = resp
            .headers()
            .get(USERINFO_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(SubscriptionInfo::parse)
        {
            log_userinfo(&info);
        }

        let content = resp.bytes().await?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::EmptyBody);
        }

        Ok(decode_body(&content))
    }

    /// Read candidates from the cache file. Missing or unreadable is empty.
    pub async fn load_cache(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.cache_path).await {
            Ok(content) => filter_candidates(&content),
            Err(e) => {
                debug!(
                    "No subscription cache at {}: {}",
                    self.cache_path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Best-effort cache write
    async fn store_cache(&self, decoded: &str) {
        if let Some(parent) = self.cache_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Failed to create cache directory: {}", e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(&self.cache_path, decoded).await {
            warn!("Failed to cache subscription: {}", e);
        }
    }

    /// Fetch candidates and report where they came from
    pub async fn fetch_with_origin(&self) -> (Vec<String>, CandidateOrigin) {
        match self.fetch_remote().await {
            Ok(decoded) => {
                let links = filter_candidates(&decoded);
                if !links.is_empty() {
                    self.store_cache(&decoded).await;
                    return (links, CandidateOrigin::Remote);
                }
                warn!("Subscription returned no recognised links, trying cache");
            }
            Err(e) => warn!("{}, trying cache", e),
        }

        let cached = self.load_cache().await;
        if cached.is_empty() {
            (cached, CandidateOrigin::Nowhere)
        } else {
            (cached, CandidateOrigin::Cache)
        }
    }
}

#[async_trait]
impl CandidateSource for SubscriptionFetcher {
    async fn fetch_candidates(&self) -> Vec<String> {
        let (links, origin) = self.fetch_with_origin().await;
        info!("Loaded {} candidate(s) from {}", links.len(), origin);
        links
    }
}

fn log_userinfo(info: &SubscriptionInfo) {
    if info.is_expired(chrono::Utc::now()) {
        warn!("Subscription expired at {:?}", info.expires_at());
        return;
    }
    match info.remaining() {
        Some(left) => debug!(
            "Subscription quota: {} MiB left, expires {:?}",
            left / (1024 * 1024),
            info.expires_at()
        ),
        None => debug!("Subscription quota: unlimited"),
    }
}
