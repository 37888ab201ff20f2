//! Engine configuration builder
//!
//! Turns one [`Outbound`] into the JSON document an Xray-class engine
//! consumes: a single loopback SOCKS inbound, exactly one outbound and a
//! log section whose error log lands in a known file for post-mortems.
//!
//! ```text
//! { "log":       { "loglevel": "warning", "access": "", "error": "<data-dir>/xray.log" },
//!   "inbounds":  [ { "protocol": "socks", "listen": "127.0.0.1", "port": 10808, ... } ],
//!   "outbounds": [ { "protocol": "vless", "settings": { "vnext": [...] }, "streamSettings": {...} } ] }
//! ```

use super::Settings;
use crate::outbound::{Outbound, Remote, Security, Transport};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Full engine configuration for one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub log: LogConfig,
    pub inbounds: Vec<InboundConfig>,
    pub outbounds: Vec<OutboundConfig>,
}

impl TunnelConfig {
    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Port of the local SOCKS inbound
    pub fn socks_port(&self) -> Option<u16> {
        self.inbounds
            .iter()
            .find(|i| i.protocol == "socks")
            .map(|i| i.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub loglevel: String,
    pub access: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundConfig {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub settings: SocksSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocksSettings {
    pub udp: bool,
    pub auth: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(rename = "streamSettings")]
    pub stream_settings: StreamSettings,
}

/// `vnext` for vless/vmess, `servers` for shadowsocks/trojan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<ServerObject> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<UserObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserObject {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerObject {
    pub address: String,
    pub port: u16,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub allow_insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub server_name: String,
    pub fingerprint: String,
    pub show: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
    pub multi_mode: bool,
}

/// Fixed local-listener and logging parameters shared by every attempt
#[derive(Debug, Clone)]
pub struct TunnelConfigBuilder {
    listen: String,
    socks_port: u16,
    log_level: String,
    error_log: PathBuf,
}

impl TunnelConfigBuilder {
    pub fn new(listen: String, socks_port: u16, log_level: String, error_log: PathBuf) -> Self {
        TunnelConfigBuilder {
            listen,
            socks_port,
            log_level,
            error_log,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.listen.clone(),
            settings.socks_port,
            settings.engine_log_level.clone(),
            settings.engine_log_path(),
        )
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    pub fn error_log(&self) -> &PathBuf {
        &self.error_log
    }

    /// Build a fresh configuration around `outbound`
    pub fn build(&self, outbound: &Outbound) -> TunnelConfig {
        TunnelConfig {
            log: LogConfig {
                loglevel: self.log_level.clone(),
                access: String::new(),
                error: self.error_log.to_string_lossy().into_owned(),
            },
            inbounds: vec![InboundConfig {
                tag: "socks-in".to_string(),
                port: self.socks_port,
                listen: self.listen.clone(),
                protocol: "socks".to_string(),
                settings: SocksSettings {
                    udp: true,
                    auth: "noauth".to_string(),
                },
            }],
            outbounds: vec![build_outbound(outbound)],
        }
    }
}

fn build_outbound(outbound: &Outbound) -> OutboundConfig {
    let remote = outbound.remote();
    let settings = match outbound {
        Outbound::Vless { remote, flow } => vnext(
            remote,
            UserObject {
                id: remote.credential.clone(),
                encryption: Some("none".to_string()),
                flow: flow.clone(),
                alter_id: None,
                security: None,
            },
        ),
        Outbound::Vmess {
            remote,
            alter_id,
            cipher,
        } => vnext(
            remote,
            UserObject {
                id: remote.credential.clone(),
                encryption: None,
                flow: None,
                alter_id: Some(*alter_id),
                security: Some(cipher.clone()),
            },
        ),
        Outbound::Shadowsocks { remote, method } => OutboundSettings::Servers {
            servers: vec![ServerObject {
                address: remote.host.clone(),
                port: remote.port,
                password: remote.credential.clone(),
                method: Some(method.clone()),
            }],
        },
        Outbound::Trojan { remote } => OutboundSettings::Servers {
            servers: vec![ServerObject {
                address: remote.host.clone(),
                port: remote.port,
                password: remote.credential.clone(),
                method: None,
            }],
        },
    };

    OutboundConfig {
        tag: "proxy".to_string(),
        protocol: protocol_name(outbound).to_string(),
        settings,
        stream_settings: stream_settings(remote),
    }
}

fn protocol_name(outbound: &Outbound) -> &'static str {
    match outbound {
        Outbound::Vless { .. } => "vless",
        Outbound::Vmess { .. } => "vmess",
        Outbound::Shadowsocks { .. } => "shadowsocks",
        Outbound::Trojan { .. } => "trojan",
    }
}

fn vnext(remote: &Remote, user: UserObject) -> OutboundSettings {
    OutboundSettings::Vnext {
        vnext: vec![VnextServer {
            address: remote.host.clone(),
            port: remote.port,
            users: vec![user],
        }],
    }
}

fn stream_settings(remote: &Remote) -> StreamSettings {
    let params = &remote.params;
    let server_name = || params.sni.clone().unwrap_or_else(|| remote.host.clone());

    let mut stream = StreamSettings {
        network: remote.transport.as_str().to_string(),
        ..Default::default()
    };

    match remote.security {
        Security::None => {}
        Security::Tls => {
            stream.security = Some("tls".to_string());
            stream.tls_settings = Some(TlsSettings {
                server_name: server_name(),
                allow_insecure: false,
                fingerprint: params.fingerprint.clone(),
            });
        }
        Security::Reality => {
            stream.security = Some("reality".to_string());
            stream.reality_settings = Some(RealitySettings {
                server_name: server_name(),
                fingerprint: params
                    .fingerprint
                    .clone()
                    .unwrap_or_else(|| crate::outbound::DEFAULT_FINGERPRINT.to_string()),
                show: false,
                public_key: params.public_key.clone(),
                short_id: params.short_id.clone(),
            });
        }
    }

    match remote.transport {
        Transport::Ws => {
            stream.ws_settings = Some(WsSettings {
                path: params.ws_path.clone().unwrap_or_else(|| "/".to_string()),
                headers: params
                    .ws_host
                    .as_ref()
                    .map(|host| BTreeMap::from([("Host".to_string(), host.clone())])),
            });
        }
        Transport::Grpc => {
            stream.grpc_settings = Some(GrpcSettings {
                service_name: params.service_name.clone().unwrap_or_default(),
                multi_mode: params.multi_mode,
            });
        }
        Transport::Tcp | Transport::Other(_) => {}
    }

    stream
}
