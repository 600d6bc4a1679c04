use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use outpost_common::{Endpoint, ProtocolKind};
use outpost_pool::TunnelConfigurator;
use serde_json::{json, Map, Value};

pub const SOCKS_INBOUND_PORT: u16 = 10808;
pub const HTTP_INBOUND_PORT: u16 = 10809;

fn credentials(ep: &Endpoint) -> Option<Value> {
    let user = ep.param("username").filter(|u| !u.is_empty())?;
    let pass = ep.param("password").unwrap_or_default();
    Some(json!([{ "user": user, "pass": pass }]))
}

fn server(ep: &Endpoint) -> Map<String, Value> {
    let mut server = Map::new();
    server.insert("address".into(), json!(ep.address));
    server.insert("port".into(), json!(ep.port));
    server
}

fn stream_settings(ep: &Endpoint) -> Value {
    let network = ep.param("network").unwrap_or("tcp");
    let mut stream = Map::new();
    stream.insert("network".into(), json!(network));

    match ep.param("security").or_else(|| ep.param("tls")) {
        Some("tls") => {
            let server_name = ep
                .param("sni")
                .or_else(|| ep.param("host"))
                .unwrap_or(ep.address.as_str());
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(server_name));
            tls.insert("allowInsecure".into(), json!(false));
            if let Some(alpn) = ep.param("alpn") {
                let protocols: Vec<&str> = alpn.split(',').map(str::trim).collect();
                tls.insert("alpn".into(), json!(protocols));
            }
            stream.insert("security".into(), json!("tls"));
            stream.insert("tlsSettings".into(), Value::Object(tls));
        }
        Some("reality") => {
            stream.insert("security".into(), json!("reality"));
            stream.insert(
                "realitySettings".into(),
                json!({
                    "serverName": ep.param("sni"),
                    "fingerprint": ep.param("fp").unwrap_or("chrome"),
                    "publicKey": ep.param("pbk"),
                    "shortId": ep.param("sid").unwrap_or_default(),
                }),
            );
        }
        _ => {}
    }

    match network {
        "ws" => {
            let mut ws = Map::new();
            ws.insert("path".into(), json!(ep.param("path").unwrap_or("/")));
            if let Some(host) = ep.param("host") {
                ws.insert("headers".into(), json!({ "Host": host }));
            }
            stream.insert("wsSettings".into(), Value::Object(ws));
        }
        "grpc" => {
            stream.insert(
                "grpcSettings".into(),
                json!({ "serviceName": ep.param("serviceName").unwrap_or_default() }),
            );
        }
        "h2" => {
            let mut h2 = Map::new();
            h2.insert("path".into(), json!(ep.param("path").unwrap_or("/")));
            if let Some(host) = ep.param("host") {
                h2.insert("host".into(), json!([host]));
            }
            stream.insert("httpSettings".into(), Value::Object(h2));
        }
        _ => {}
    }

    Value::Object(stream)
}

/// The `proxy` outbound for the active endpoint.
pub fn proxy_outbound(ep: &Endpoint) -> Value {
    let settings = match ep.protocol {
        ProtocolKind::Vmess => json!({
            "vnext": [{
                "address": ep.address,
                "port": ep.port,
                "users": [{
                    "id": ep.param("uuid"),
                    "security": ep.param("cipher").unwrap_or("auto"),
                    "level": 0,
                }],
            }],
        }),
        ProtocolKind::Vless => json!({
            "vnext": [{
                "address": ep.address,
                "port": ep.port,
                "users": [{
                    "id": ep.param("uuid"),
                    "encryption": "none",
                    "flow": ep.param("flow").unwrap_or_default(),
                    "level": 0,
                }],
            }],
        }),
        ProtocolKind::Trojan => {
            let mut server = server(ep);
            server.insert("password".into(), json!(ep.param("password")));
            server.insert("level".into(), json!(0));
            json!({ "servers": [server] })
        }
        ProtocolKind::Shadowsocks => {
            let mut server = server(ep);
            server.insert("method".into(), json!(ep.param("method")));
            server.insert("password".into(), json!(ep.param("password")));
            json!({ "servers": [server] })
        }
        ProtocolKind::Socks5 | ProtocolKind::Http => {
            let mut server = server(ep);
            if let Some(users) = credentials(ep) {
                server.insert("users".into(), users);
            }
            json!({ "servers": [server] })
        }
    };

    let protocol = match ep.protocol {
        ProtocolKind::Socks5 => "socks",
        other => other.as_str(),
    };
    let mut outbound = json!({
        "tag": "proxy",
        "protocol": protocol,
        "settings": settings,
    });
    if ep.protocol.is_tunneled() {
        outbound["streamSettings"] = stream_settings(ep);
    }
    outbound
}

/// Full data-plane document: local socks and http inbounds, everything routed
/// through the active endpoint except ad domains.
pub fn render_config(ep: &Endpoint) -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [
            {
                "tag": "socks-in",
                "port": SOCKS_INBOUND_PORT,
                "listen": "127.0.0.1",
                "protocol": "socks",
                "settings": { "udp": true, "auth": "noauth" },
                "sniffing": { "enabled": true, "destOverride": ["http", "tls"] },
            },
            {
                "tag": "http-in",
                "port": HTTP_INBOUND_PORT,
                "listen": "127.0.0.1",
                "protocol": "http",
                "settings": {},
            },
        ],
        "outbounds": [
            proxy_outbound(ep),
            { "tag": "direct", "protocol": "freedom", "settings": {} },
            { "tag": "block", "protocol": "blackhole", "settings": { "response": { "type": "http" } } },
        ],
        "routing": {
            "domainStrategy": "IPIfNonMatch",
            "rules": [
                { "type": "field", "domain": ["geosite:category-ads-all"], "outboundTag": "block" },
                { "type": "field", "network": "tcp,udp", "outboundTag": "proxy" },
            ],
        },
    })
}

/// Rewrites the proxy engine's config file whenever the active endpoint changes.
#[derive(Debug, Clone)]
pub struct XrayConfigWriter {
    path: PathBuf,
}

impl XrayConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TunnelConfigurator for XrayConfigWriter {
    async fn apply_active_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(&render_config(endpoint))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        tracing::info!(
            endpoint_id = %endpoint.id,
            path = %self.path.display(),
            "tunnel config written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_ep(protocol: ProtocolKind, params: &[(&str, &str)]) -> Endpoint {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Endpoint::new("n1", "node one", protocol, "edge.example.com", 443, params).unwrap()
    }

    #[test]
    fn test_vmess_ws_tls() {
        let ep = make_ep(
            ProtocolKind::Vmess,
            &[
                ("uuid", "b831381d-6324-4d53-ad4f-8cda48b30811"),
                ("network", "ws"),
                ("security", "tls"),
                ("path", "/ray"),
                ("host", "cdn.example.com"),
                ("alpn", "h2, http/1.1"),
            ],
        );
        let out = proxy_outbound(&ep);
        assert_eq!(out["protocol"], "vmess");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["id"], "b831381d-6324-4d53-ad4f-8cda48b30811");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["security"], "auto");

        let stream = &out["streamSettings"];
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["tlsSettings"]["serverName"], "cdn.example.com");
        assert_eq!(stream["tlsSettings"]["alpn"], json!(["h2", "http/1.1"]));
        assert_eq!(stream["wsSettings"]["path"], "/ray");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
    }

    #[test]
    fn test_vless_reality_grpc() {
        let ep = make_ep(
            ProtocolKind::Vless,
            &[
                ("uuid", "b831381d-6324-4d53-ad4f-8cda48b30811"),
                ("network", "grpc"),
                ("serviceName", "tun"),
                ("security", "reality"),
                ("sni", "www.microsoft.com"),
                ("pbk", "Z84J2IelR9ch3k8VtlVhhs5ycBUlXA7wHBWcBrjqnAw"),
                ("flow", "xtls-rprx-vision"),
            ],
        );
        let out = proxy_outbound(&ep);
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["flow"], "xtls-rprx-vision");
        let stream = &out["streamSettings"];
        assert_eq!(stream["security"], "reality");
        assert_eq!(stream["realitySettings"]["fingerprint"], "chrome");
        assert_eq!(stream["realitySettings"]["serverName"], "www.microsoft.com");
        assert_eq!(stream["grpcSettings"]["serviceName"], "tun");
        assert!(stream.get("tlsSettings").is_none());
    }

    #[test]
    fn test_plain_proxies_have_no_stream_settings() {
        let socks = make_ep(ProtocolKind::Socks5, &[("username", "u"), ("password", "p")]);
        let out = proxy_outbound(&socks);
        assert_eq!(out["protocol"], "socks");
        assert_eq!(out["settings"]["servers"][0]["users"][0]["user"], "u");
        assert!(out.get("streamSettings").is_none());

        let http = make_ep(ProtocolKind::Http, &[]);
        let out = proxy_outbound(&http);
        assert_eq!(out["protocol"], "http");
        assert!(out["settings"]["servers"][0].get("users").is_none());
    }

    #[test]
    fn test_shadowsocks_outbound() {
        let ep = make_ep(
            ProtocolKind::Shadowsocks,
            &[("method", "aes-256-gcm"), ("password", "hunter2")],
        );
        let out = proxy_outbound(&ep);
        assert_eq!(out["protocol"], "shadowsocks");
        assert_eq!(out["settings"]["servers"][0]["method"], "aes-256-gcm");
        assert_eq!(out["streamSettings"]["network"], "tcp");
    }

    #[tokio::test]
    async fn test_writer_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = XrayConfigWriter::new(dir.path().join("config.json"));
        let ep = make_ep(ProtocolKind::Trojan, &[("password", "secret"), ("security", "tls")]);
        writer.apply_active_endpoint(&ep).await.unwrap();

        let raw = std::fs::read(writer.path()).unwrap();
        let doc: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc["inbounds"][0]["port"], SOCKS_INBOUND_PORT);
        assert_eq!(doc["outbounds"][0]["settings"]["servers"][0]["password"], "secret");
        assert_eq!(doc["outbounds"][2]["tag"], "block");
        assert!(!dir.path().join("config.json.tmp").exists());
    }
}
