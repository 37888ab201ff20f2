//! VMess link decoder
//!
//! Format: `vmess://base64(json)` where the JSON document follows the v2rayN
//! share format (`add`, `port`, `id`, `aid`, `scy`, `net`, `tls`, `sni`, ...).
//! Numeric fields appear both as JSON numbers and as strings in the wild.

use super::{
    non_empty, parse_port, Outbound, Remote, Security, StreamParams, Transport,
    DEFAULT_REMOTE_PORT,
};
use crate::common::base64::decode_text;
use crate::common::DecodeError;
use serde_json::{Map, Value};

const PREFIX: &str = "vmess://";

/// Default VMess body cipher
const DEFAULT_CIPHER: &str = "auto";

/// Decode a `vmess://` link
pub fn decode_vmess(link: &str) -> Result<Outbound, DecodeError> {
    let payload = link
        .strip_prefix(PREFIX)
        .ok_or_else(|| DecodeError::malformed("not a vmess link"))?;

    let json = decode_text(payload)
        .ok_or_else(|| DecodeError::malformed("vmess payload is not valid base64 text"))?;
    let value: Value = serde_json::from_str(&json)
        .map_err(|e| DecodeError::malformed(format!("vmess payload is not JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::malformed("vmess payload is not a JSON object"))?;

    let host = string_field(obj, "add")
        .ok_or_else(|| DecodeError::malformed("vmess link has no address"))?;
    let port = match scalar_field(obj, "port") {
        Some(port) => parse_port(&port)?,
        None => DEFAULT_REMOTE_PORT,
    };
    let credential =
        string_field(obj, "id").ok_or_else(|| DecodeError::malformed("vmess link has no id"))?;

    let alter_id = match scalar_field(obj, "aid") {
        Some(aid) => aid
            .parse::<u32>()
            .map_err(|_| DecodeError::malformed(format!("invalid alterId: {}", aid)))?,
        None => 0,
    };
    let cipher = string_field(obj, "scy").unwrap_or_else(|| DEFAULT_CIPHER.to_string());

    let transport = Transport::parse(&string_field(obj, "net").unwrap_or_default());
    let security = Security::parse(&string_field(obj, "tls").unwrap_or_default())?;

    let mut params = StreamParams {
        sni: string_field(obj, "sni"),
        fingerprint: string_field(obj, "fp"),
        allow_insecure: false,
        ..Default::default()
    };
    match transport {
        Transport::Ws => {
            params.ws_path = string_field(obj, "path");
            params.ws_host = string_field(obj, "host");
        }
        Transport::Grpc => {
            params.service_name = string_field(obj, "path");
        }
        _ => {}
    }
    if security != Security::None {
        params.sni.get_or_insert_with(|| host.clone());
    }

    Ok(Outbound::Vmess {
        remote: Remote {
            host,
            port,
            credential,
            transport,
            security,
            params,
            name: string_field(obj, "ps"),
        },
        alter_id,
        cipher,
    })
}

/// Non-empty string field
fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    non_empty(obj.get(key).and_then(Value::as_str).map(|s| s.trim().to_string()))
}

/// String or number field rendered as a string
fn scalar_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => non_empty(Some(s.trim().to_string())),
        _ => None,
    }
}
