//! Link scheme classifier
//!
//! Decides which subscription lines are candidates at all, and which of
//! those we can actually decode:
//! - Structured: vless, vmess
//! - Recognised only: ss, trojan (kept by the filter, skipped by the retry loop)

/// Subscription link scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Vless,
    Vmess,
    Shadowsocks,
    Trojan,
}

/// Every scheme the subscription filter keeps, in dispatch order
pub const RECOGNISED_SCHEMES: [Scheme; 4] = [
    Scheme::Vless,
    Scheme::Vmess,
    Scheme::Shadowsocks,
    Scheme::Trojan,
];

impl Scheme {
    /// URI prefix including `://`
    pub fn prefix(&self) -> &'static str {
        match self {
            Scheme::Vless => "vless://",
            Scheme::Vmess => "vmess://",
            Scheme::Shadowsocks => "ss://",
            Scheme::Trojan => "trojan://",
        }
    }

    pub fn tier(&self) -> DecodeTier {
        match self {
            Scheme::Vless | Scheme::Vmess => DecodeTier::Structured,
            Scheme::Shadowsocks | Scheme::Trojan => DecodeTier::RecognisedOnly,
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.prefix().trim_end_matches("://"))
    }
}

/// How far a scheme is supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeTier {
    /// Decoded into an engine outbound
    Structured,
    /// Accepted as a candidate but has no decoder
    RecognisedOnly,
}

impl std::fmt::Display for DecodeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeTier::Structured => f.pad("structured"),
            DecodeTier::RecognisedOnly => f.pad("unsupported"),
        }
    }
}

/// Classify a link by its scheme prefix. Matching is case-sensitive,
/// like the subscription filter.
pub fn classify_link(link: &str) -> Option<Scheme> {
    RECOGNISED_SCHEMES
        .into_iter()
        .find(|scheme| link.starts_with(scheme.prefix()))
}

/// Check if a line should survive subscription filtering
pub fn is_candidate(line: &str) -> bool {
    classify_link(line).is_some()
}

/// Check if a link can be turned into an engine outbound
pub fn is_decodable(link: &str) -> bool {
    matches!(
        classify_link(link).map(|s| s.tier()),
        Some(DecodeTier::Structured)
    )
}
