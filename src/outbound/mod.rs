//! Decoded proxy outbounds
//!
//! A subscription line (`vless://…`, `vmess://…`, `ss://…`, `trojan://…`) is
//! decoded into an [`Outbound`]: where the remote proxy lives, how to
//! authenticate to it and which transport/security layers wrap the stream.
//! Decoding is pure; nothing here touches the network or the filesystem.
//!
//! Only VLESS and VMess have structured decoders. Shadowsocks and Trojan
//! lines are recognised (they survive subscription filtering) but decode to
//! [`DecodeError::UnsupportedScheme`] so the retry loop skips them.

pub mod classifier;
mod vless;
mod vmess;

pub use classifier::{classify_link, DecodeTier, Scheme};
pub use vless::decode_vless;
pub use vmess::decode_vmess;

use crate::common::DecodeError;
use std::fmt;

/// Default remote port when a link omits one
pub const DEFAULT_REMOTE_PORT: u16 = 443;

/// Default uTLS fingerprint
pub const DEFAULT_FINGERPRINT: &str = "chrome";

/// Stream transport carried under the proxy protocol
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Grpc,
    /// Any other network name, handed to the engine verbatim
    Other(String),
}

impl Transport {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => Transport::Tcp,
            "ws" | "websocket" => Transport::Ws,
            "grpc" => Transport::Grpc,
            other => Transport::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
            Transport::Grpc => "grpc",
            Transport::Other(s) => s,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Security layer wrapping the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Security::None),
            "tls" => Ok(Security::Tls),
            "reality" => Ok(Security::Reality),
            other => Err(DecodeError::malformed(format!(
                "unknown security mode: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport- and security-specific parameters
///
/// Only the fields relevant to the outbound's transport/security pair are
/// emitted into the engine config; the rest are carried but ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamParams {
    /// TLS/Reality server name
    pub sni: Option<String>,
    /// uTLS fingerprint
    pub fingerprint: Option<String>,
    /// Reality public key (`pbk`)
    pub public_key: Option<String>,
    /// Reality short id (`sid`)
    pub short_id: Option<String>,
    /// WebSocket path
    pub ws_path: Option<String>,
    /// WebSocket Host header
    pub ws_host: Option<String>,
    /// gRPC service name
    pub service_name: Option<String>,
    /// gRPC multi mode (`mode=multi`)
    pub multi_mode: bool,
    /// Never set by the decoders; certificate errors are always fatal
    pub allow_insecure: bool,
}

/// Where a remote proxy lives and how the stream to it is wrapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub host: String,
    pub port: u16,
    /// UUID for vless/vmess, password for shadowsocks/trojan
    pub credential: String,
    pub transport: Transport,
    pub security: Security,
    pub params: StreamParams,
    /// Display name from the link (`#fragment` / vmess `ps`)
    pub name: Option<String>,
}

impl Remote {
    /// Label used in logs
    pub fn label(&self) -> String {
        match self.name {
            Some(ref name) => format!("{} ({}:{})", name, self.host, self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// One decoded subscription candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Vless {
        remote: Remote,
        flow: Option<String>,
    },
    Vmess {
        remote: Remote,
        alter_id: u32,
        /// VMess body cipher (`scy`)
        cipher: String,
    },
    Shadowsocks {
        remote: Remote,
        method: String,
    },
    Trojan {
        remote: Remote,
    },
}

impl Outbound {
    pub fn remote(&self) -> &Remote {
        match self {
            Outbound::Vless { remote, .. }
            | Outbound::Vmess { remote, .. }
            | Outbound::Shadowsocks { remote, .. }
            | Outbound::Trojan { remote } => remote,
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            Outbound::Vless { .. } => Scheme::Vless,
            Outbound::Vmess { .. } => Scheme::Vmess,
            Outbound::Shadowsocks { .. } => Scheme::Shadowsocks,
            Outbound::Trojan { .. } => Scheme::Trojan,
        }
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remote = self.remote();
        write!(
            f,
            "{} {} [{}/{}]",
            self.scheme(),
            remote.label(),
            remote.transport,
            remote.security
        )
    }
}

/// Decode one subscription line.
///
/// Dispatch is strictly by scheme prefix. Never panics on malformed input.
pub fn decode(link: &str) -> Result<Outbound, DecodeError> {
    let link = link.trim();
    match classify_link(link) {
        Some(Scheme::Vless) => decode_vless(link),
        Some(Scheme::Vmess) => decode_vmess(link),
        Some(scheme @ (Scheme::Shadowsocks | Scheme::Trojan)) => {
            Err(DecodeError::UnsupportedScheme(scheme.to_string()))
        }
        None => Err(DecodeError::UnsupportedScheme(scheme_of(link).to_string())),
    }
}

fn scheme_of(link: &str) -> &str {
    link.split_once("://").map(|(s, _)| s).unwrap_or(link)
}

/// Parse a port, rejecting zero and anything outside 16 bits
pub(crate) fn parse_port(s: &str) -> Result<u16, DecodeError> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(DecodeError::malformed(format!("invalid port: {}", s))),
        Ok(port) => Ok(port),
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals
pub(crate) fn split_host_port(s: &str) -> Result<(String, Option<u16>), DecodeError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| DecodeError::malformed("unterminated IPv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(DecodeError::malformed(format!("bad authority: {}", s))),
        };
        return Ok((host.to_string(), port));
    }

    match s.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((s.to_string(), None)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
