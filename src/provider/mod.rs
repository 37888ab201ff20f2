//! Subscription provider
//!
//! Pulls the candidate list from the user's subscription URL, falling back
//! to the last good copy on disk when the network is unavailable.

mod fetcher;

pub use fetcher::SubscriptionFetcher;

use crate::common::base64::decode_text;
use crate::outbound::classifier::is_candidate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Anything that can produce an ordered list of candidate links
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Candidate links in source order. Never fails: total failure is an
    /// empty list.
    async fn fetch_candidates(&self) -> Vec<String>;
}

/// Where a candidate list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Remote,
    Cache,
    Nowhere,
}

impl std::fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateOrigin::Remote => write!(f, "remote"),
            CandidateOrigin::Cache => write!(f, "cache"),
            CandidateOrigin::Nowhere => write!(f, "none"),
        }
    }
}

/// Decode a subscription body.
///
/// Bodies are usually base64 of a newline-separated list; anything that
/// does not decode to UTF-8 text is taken to be the list itself.
pub fn decode_body(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match decode_text(&text) {
        Some(decoded) => decoded,
        None => text.into_owned(),
    }
}

/// Keep recognised links, trimmed, in source order
pub fn filter_candidates(decoded: &str) -> Vec<String> {
    decoded
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && is_candidate(line))
        .map(String::from)
        .collect()
}

/// Subscription information parsed from headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Upload bytes used
    pub upload: u64,
    /// Download bytes used
    pub download: u64,
    /// Total bytes available
    pub total: u64,
    /// Expiration timestamp (Unix epoch, 0 = never)
    pub expire: i64,
}

impl SubscriptionInfo {
    /// Parse from Subscription-Userinfo header
    ///
    /// Format: "upload=xxx; download=xxx; total=xxx; expire=xxx"
    pub fn parse(header: &str) -> Option<Self> {
        let mut info = SubscriptionInfo::default();
        let mut seen = false;

        for part in header.split(';') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_lowercase().as_str() {
                "upload" => info.upload = value.parse().unwrap_or(0),
                "download" => info.download = value.parse().unwrap_or(0),
                "total" => info.total = value.parse().unwrap_or(0),
                "expire" => info.expire = value.parse().unwrap_or(0),
                _ => continue,
            }
            seen = true;
        }

        seen.then_some(info)
    }

    /// Bytes left before the quota runs out (None = unlimited)
    pub fn remaining(&self) -> Option<u64> {
        let used = self.upload.saturating_add(self.download);
        (self.total > 0).then(|| self.total.saturating_sub(used))
    }

    /// Expiry as a timestamp (None = never)
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expire <= 0 {
            return None;
        }
        DateTime::from_timestamp(self.expire, 0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn test_filter_preserves_order_and_schemes() {
        let body = "vmess://AAA\n\
                    # comment\n\
                    \n\
                    hysteria2://pw@h:1\n  \
                    trojan://pw@h:443  \n\
                    ss://xyz@h:8388\r\n\
                    https://example.com\n\
                    vless://u@h:443\n";
        assert_eq!(
            filter_candidates(body),
            vec![
                "vmess://AAA",
                "trojan://pw@h:443",
                "ss://xyz@h:8388",
                "vless://u@h:443",
            ]
        );
    }

    #[test]
    fn test_decode_body_base64() {
        let plain = "vless://a@h:443\nvmess://BBB\n";
        let encoded = STANDARD.encode(plain);
        assert_eq!(decode_body(encoded.as_bytes()), plain);
    }

    #[test]
    fn test_decode_body_plain_passthrough() {
        let plain = "vless://a@h:443\ntrojan://p@h:443";
        assert_eq!(decode_body(plain.as_bytes()), plain);
    }

    #[test]
    fn test_decode_body_wrapped_base64() {
        let plain = "vless://a@h:443\nvless://b@h:443\nvless://c@h:443\n";
        let encoded = STANDARD.encode(plain);
        let wrapped: String = encoded
            .as_bytes()
            .chunks(16)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(decode_body(wrapped.as_bytes()), plain);
    }

    #[test]
    fn test_subscription_info_parse() {
        let info = SubscriptionInfo::parse(
            "upload=1024; download=2048; total=10240; expire=1893456000",
        )
        .unwrap();
        assert_eq!(info.upload, 1024);
        assert_eq!(info.download, 2048);
        assert_eq!(info.remaining(), Some(10240 - 3072));
        assert_eq!(info.expires_at().unwrap().timestamp(), 1893456000);
        assert!(!info.is_expired(DateTime::from_timestamp(0, 0).unwrap()));
    }

    #[test]
    fn test_subscription_info_unlimited() {
        let info = SubscriptionInfo::parse("upload=0; download=0; total=0; expire=0").unwrap();
        assert_eq!(info.remaining(), None);
        assert_eq!(info.expires_at(), None);
        assert!(SubscriptionInfo::parse("garbage").is_none());
    }

    #[test]
    fn test_subscription_info_saturates_on_huge_usage() {
        let info =
            SubscriptionInfo::parse("upload=18446744073709551615; download=1; total=10").unwrap();
        assert_eq!(info.remaining(), Some(0));
    }
}
