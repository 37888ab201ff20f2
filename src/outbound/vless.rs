//! VLESS link decoder
//!
//! Format: `vless://uuid@host[:port][?key=value&...][#name]`

use super::{
    non_empty, split_host_port, Outbound, Remote, Security, StreamParams, Transport,
    DEFAULT_FINGERPRINT, DEFAULT_REMOTE_PORT,
};
use crate::common::DecodeError;
use std::collections::HashMap;
use tracing::debug;

const PREFIX: &str = "vless://";

/// Query keys the decoder understands
const KNOWN_KEYS: &[&str] = &[
    "type",
    "security",
    "flow",
    "sni",
    "fp",
    "pbk",
    "sid",
    "path",
    "host",
    "serviceName",
    "mode",
];

/// Decode a `vless://` link
pub fn decode_vless(link: &str) -> Result<Outbound, DecodeError> {
    let body = link
        .strip_prefix(PREFIX)
        .ok_or_else(|| DecodeError::malformed("not a vless link"))?;

    let (body, name) = match body.split_once('#') {
        Some((body, fragment)) => (body, non_empty(Some(percent_decode(fragment)?))),
        None => (body, None),
    };

    let (credential, rest) = body
        .split_once('@')
        .ok_or_else(|| DecodeError::malformed("vless link has no '@'"))?;
    let credential = credential.trim();
    if credential.is_empty() {
        return Err(DecodeError::malformed("vless link has an empty id"));
    }

    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, query),
        None => (rest, ""),
    };
    let authority = authority.trim_end_matches('/');

    let (host, port) = split_host_port(authority)?;
    if host.is_empty() {
        return Err(DecodeError::malformed("vless link has no host"));
    }
    let port = port.unwrap_or(DEFAULT_REMOTE_PORT);

    let params = parse_query(query)?;
    let get = |key: &str| non_empty(params.get(key).cloned());

    let transport = Transport::parse(params.get("type").map(String::as_str).unwrap_or("tcp"));
    let security = Security::parse(params.get("security").map(String::as_str).unwrap_or("none"))?;

    let mut stream = StreamParams {
        sni: get("sni"),
        fingerprint: get("fp"),
        ws_path: get("path"),
        ws_host: get("host"),
        service_name: get("serviceName"),
        multi_mode: params.get("mode").map(|m| m == "multi").unwrap_or(false),
        allow_insecure: false,
        ..Default::default()
    };

    match security {
        Security::Tls | Security::Reality => {
            stream.sni.get_or_insert_with(|| host.clone());
            stream
                .fingerprint
                .get_or_insert_with(|| DEFAULT_FINGERPRINT.to_string());
            if security == Security::Reality {
                stream.public_key = get("pbk");
                stream.short_id = get("sid");
            }
        }
        Security::None => {}
    }

    for key in params.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            debug!("Ignoring vless parameter '{}'", key);
        }
    }

    Ok(Outbound::Vless {
        remote: Remote {
            host,
            port,
            credential: credential.to_string(),
            transport,
            security,
            params: stream,
            name,
        },
        flow: get("flow"),
    })
}

/// Parse a flat query string. The first occurrence of a key wins.
fn parse_query(query: &str) -> Result<HashMap<String, String>, DecodeError> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if params.contains_key(key) {
            continue;
        }
        params.insert(key.to_string(), percent_decode(value)?);
    }
    Ok(params)
}

fn percent_decode(s: &str) -> Result<String, DecodeError> {
    urlencoding::decode(s)
        .map(|v| v.into_owned())
        .map_err(|e| DecodeError::malformed(format!("bad percent-encoding: {}", e)))
}
