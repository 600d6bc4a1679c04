use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_BASE_WEIGHT: u32 = 100;
pub const MIN_BASE_WEIGHT: u32 = 1;
pub const MAX_BASE_WEIGHT: u32 = 200;

/// Ciphers accepted for shadowsocks endpoints.
const SHADOWSOCKS_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "chacha20-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

const STREAM_NETWORKS: &[&str] = &["tcp", "ws", "grpc", "h2"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Socks5,
    Http,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Vmess => "vmess",
            ProtocolKind::Vless => "vless",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::Shadowsocks => "shadowsocks",
            ProtocolKind::Socks5 => "socks5",
            ProtocolKind::Http => "http",
        }
    }

    /// Protocols that can only be spoken by the external proxy engine. Traffic
    /// for them has to go through the engine's local bridge listener.
    pub fn is_tunneled(&self) -> bool {
        !matches!(self, ProtocolKind::Socks5 | ProtocolKind::Http)
    }

    /// Check the protocol-specific parameters of endpoint `id`.
    pub fn validate_params(
        &self,
        id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        let require = |field: &'static str| -> Result<&str, ConfigError> {
            params
                .get(field)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingParam {
                    id: id.to_string(),
                    protocol: *self,
                    field,
                })
        };

        match self {
            ProtocolKind::Vmess | ProtocolKind::Vless => {
                let raw = require("uuid")?;
                if uuid::Uuid::parse_str(raw).is_err() {
                    return Err(ConfigError::InvalidParam {
                        id: id.to_string(),
                        field: "uuid",
                        reason: format!("'{raw}' is not a uuid"),
                    });
                }
            }
            ProtocolKind::Trojan => {
                require("password")?;
            }
            ProtocolKind::Shadowsocks => {
                let method = require("method")?;
                require("password")?;
                if !SHADOWSOCKS_METHODS.contains(&method) {
                    return Err(ConfigError::InvalidParam {
                        id: id.to_string(),
                        field: "method",
                        reason: format!("unsupported cipher '{method}'"),
                    });
                }
            }
            ProtocolKind::Socks5 | ProtocolKind::Http => {
                let has_user = params.get("username").is_some_and(|v| !v.is_empty());
                let has_pass = params.get("password").is_some_and(|v| !v.is_empty());
                if has_user != has_pass {
                    return Err(ConfigError::InvalidParam {
                        id: id.to_string(),
                        field: if has_user { "password" } else { "username" },
                        reason: "username and password must be given together".to_string(),
                    });
                }
            }
        }

        if self.is_tunneled() {
            if let Some(network) = params.get("network") {
                if !STREAM_NETWORKS.contains(&network.as_str()) {
                    return Err(ConfigError::InvalidParam {
                        id: id.to_string(),
                        field: "network",
                        reason: format!("unsupported transport '{network}'"),
                    });
                }
            }
            if params.get("security").map(String::as_str) == Some("reality") {
                require("pbk")?;
                require("sni")?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vmess" => Ok(ProtocolKind::Vmess),
            "vless" => Ok(ProtocolKind::Vless),
            "trojan" => Ok(ProtocolKind::Trojan),
            "shadowsocks" | "ss" => Ok(ProtocolKind::Shadowsocks),
            "socks5" | "socks" => Ok(ProtocolKind::Socks5),
            "http" => Ok(ProtocolKind::Http),
            other => Err(format!(
                "unknown protocol '{other}', available: vmess, vless, trojan, shadowsocks, socks5, http"
            )),
        }
    }
}

fn default_healthy() -> bool {
    true
}

fn default_base_weight() -> u32 {
    DEFAULT_BASE_WEIGHT
}

/// One remote proxy target plus the health state the pool keeps for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub id: String,
    pub display_name: String,
    pub protocol: ProtocolKind,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Smoothed latency; `None` while unknown or unreachable.
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default = "default_healthy")]
    pub is_healthy: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_checked_ms: u64,
    #[serde(default = "default_base_weight")]
    pub base_weight: u32,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub total_requests: u64,
}

impl Endpoint {
    /// Build and validate a fresh endpoint.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        protocol: ProtocolKind,
        address: impl Into<String>,
        port: u16,
        params: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let ep = Self {
            id: id.into(),
            display_name: display_name.into(),
            protocol,
            address: address.into(),
            port,
            params,
            latency_ms: None,
            is_healthy: true,
            consecutive_failures: 0,
            last_checked_ms: 0,
            base_weight: DEFAULT_BASE_WEIGHT,
            success_count: 0,
            total_requests: 0,
        };
        ep.validate()?;
        Ok(ep)
    }

    pub fn with_base_weight(mut self, weight: u32) -> Result<Self, ConfigError> {
        self.base_weight = weight;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyId);
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress {
                id: self.id.clone(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort {
                id: self.id.clone(),
            });
        }
        if !(MIN_BASE_WEIGHT..=MAX_BASE_WEIGHT).contains(&self.base_weight) {
            return Err(ConfigError::BaseWeight {
                id: self.id.clone(),
                weight: self.base_weight,
            });
        }
        self.protocol.validate_params(&self.id, &self.params)
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        (self.success_count as f64 / self.total_requests as f64).clamp(0.0, 1.0)
    }

    pub fn performance_score(&self) -> f64 {
        let latency_score = match self.latency_ms {
            Some(ms) => 1000.0 / ms.max(1) as f64,
            None => 0.0,
        };
        self.success_rate() * 0.7 + latency_score * 0.3
    }

    /// Latency for ordering purposes; unknown sorts last.
    pub fn latency_key(&self) -> u64 {
        self.latency_ms.unwrap_or(u64::MAX)
    }

    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Exponential smoothing used for every latency sample.
pub fn smooth_latency(previous: Option<u64>, sample_ms: u64) -> u64 {
    match previous {
        None => sample_ms,
        Some(old) => (old as f64 * 0.7 + sample_ms as f64 * 0.3) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_vmess_requires_uuid() {
        let err = Endpoint::new("a", "a", ProtocolKind::Vmess, "1.2.3.4", 443, params(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingParam { field: "uuid", .. }));

        let err = Endpoint::new(
            "a",
            "a",
            ProtocolKind::Vmess,
            "1.2.3.4",
            443,
            params(&[("uuid", "not-a-uuid")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParam { field: "uuid", .. }));

        assert!(Endpoint::new(
            "a",
            "a",
            ProtocolKind::Vmess,
            "1.2.3.4",
            443,
            params(&[("uuid", "b831381d-6324-4d53-ad4f-8cda48b30811")]),
        )
        .is_ok());
    }

    #[test]
    fn test_shadowsocks_cipher_checked() {
        let err = Endpoint::new(
            "ss",
            "ss",
            ProtocolKind::Shadowsocks,
            "1.2.3.4",
            8388,
            params(&[("method", "rc4"), ("password", "pw")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParam { field: "method", .. }));
    }

    #[test]
    fn test_socks_credentials_pair() {
        let err = Endpoint::new(
            "s",
            "s",
            ProtocolKind::Socks5,
            "1.2.3.4",
            1080,
            params(&[("username", "u")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParam { field: "password", .. }));
        assert!(Endpoint::new("s", "s", ProtocolKind::Socks5, "1.2.3.4", 1080, params(&[])).is_ok());
    }

    #[test]
    fn test_reality_needs_public_key() {
        let err = Endpoint::new(
            "v",
            "v",
            ProtocolKind::Vless,
            "1.2.3.4",
            443,
            params(&[
                ("uuid", "b831381d-6324-4d53-ad4f-8cda48b30811"),
                ("security", "reality"),
                ("sni", "example.com"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingParam { field: "pbk", .. }));
    }

    #[test]
    fn test_base_weight_bounds() {
        let ep = Endpoint::new("h", "h", ProtocolKind::Http, "1.2.3.4", 8080, params(&[])).unwrap();
        assert!(ep.clone().with_base_weight(0).is_err());
        assert!(ep.clone().with_base_weight(201).is_err());
        assert_eq!(ep.with_base_weight(200).unwrap().base_weight, 200);
    }

    #[test]
    fn test_derived_metrics() {
        let mut ep =
            Endpoint::new("h", "h", ProtocolKind::Http, "1.2.3.4", 8080, params(&[])).unwrap();
        assert_eq!(ep.success_rate(), 1.0);
        assert_eq!(ep.performance_score(), 0.7);

        ep.total_requests = 4;
        ep.success_count = 3;
        ep.latency_ms = Some(100);
        assert!((ep.success_rate() - 0.75).abs() < 1e-9);
        assert!((ep.performance_score() - (0.75 * 0.7 + 10.0 * 0.3)).abs() < 1e-9);

        ep.latency_ms = Some(0);
        assert!(ep.performance_score().is_finite());
    }

    #[test]
    fn test_smooth_latency() {
        assert_eq!(smooth_latency(None, 120), 120);
        assert_eq!(smooth_latency(Some(100), 200), 130);
    }

    #[test]
    fn test_deserialize_applies_state_defaults() {
        let ep: Endpoint = serde_json::from_str(
            r#"{"id":"jp-1","display_name":"Tokyo","protocol":"trojan","address":"jp.example.com","port":443,"params":{"password":"pw"}}"#,
        )
        .unwrap();
        assert!(ep.is_healthy);
        assert_eq!(ep.base_weight, DEFAULT_BASE_WEIGHT);
        assert_eq!(ep.latency_ms, None);
        assert_eq!(ep.total_requests, 0);
        ep.validate().unwrap();
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("SS".parse::<ProtocolKind>().unwrap(), ProtocolKind::Shadowsocks);
        assert_eq!("socks".parse::<ProtocolKind>().unwrap(), ProtocolKind::Socks5);
        assert!("wireguard".parse::<ProtocolKind>().is_err());
    }
}
