use async_trait::async_trait;
use outpost_common::{Endpoint, PoolError, ProtocolKind};
use tokio::net::TcpStream;

/// Network side of a health probe. Implementations only perform I/O; the
/// prober owns timeouts and bookkeeping.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Open and close a raw connection to the endpoint's address.
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), PoolError>;

    /// Request `url` through the endpoint's proxy capability and return the HTTP status.
    async fn fetch(&self, endpoint: &Endpoint, url: &str) -> Result<u16, PoolError>;
}

/// Probe transport backed by real sockets and `reqwest`.
///
/// `http` and `socks5` endpoints are used directly as the request proxy. The
/// tunneled protocols are reached through the proxy engine's local SOCKS
/// bridge, which forwards to whatever endpoint is active in the engine. For a
/// tunneled endpoint that is not the active one, the behavioral result
/// therefore describes the active endpoint; only the transport phase tells
/// such candidates apart.
#[derive(Debug, Clone)]
pub struct NetProbe {
    bridge_socks_addr: String,
}

impl NetProbe {
    pub fn new(bridge_socks_addr: impl Into<String>) -> Self {
        Self {
            bridge_socks_addr: bridge_socks_addr.into(),
        }
    }

    /// Whether the behavioral request for `endpoint` goes through the bridge.
    pub fn is_bridged(endpoint: &Endpoint) -> bool {
        !matches!(endpoint.protocol, ProtocolKind::Http | ProtocolKind::Socks5)
    }

    fn credentials(endpoint: &Endpoint) -> Option<(&str, &str)> {
        endpoint
            .param("username")
            .zip(endpoint.param("password"))
            .filter(|(user, _)| !user.is_empty())
    }

    /// SOCKS credentials are carried in the URL; HTTP ones become basic auth.
    fn proxy_url(&self, endpoint: &Endpoint) -> Result<reqwest::Url, PoolError> {
        let raw = match endpoint.protocol {
            ProtocolKind::Http => format!("http://{}", endpoint.authority()),
            ProtocolKind::Socks5 => format!("socks5h://{}", endpoint.authority()),
            _ => format!("socks5h://{}", self.bridge_socks_addr),
        };
        let mut url = reqwest::Url::parse(&raw).map_err(|e| PoolError::probe(&endpoint.id, e))?;

        if matches!(endpoint.protocol, ProtocolKind::Socks5) {
            if let Some((user, pass)) = Self::credentials(endpoint) {
                url.set_username(user)
                    .map_err(|()| PoolError::probe(&endpoint.id, format!("cannot set proxy username on {raw}")))?;
                url.set_password(Some(pass))
                    .map_err(|()| PoolError::probe(&endpoint.id, format!("cannot set proxy password on {raw}")))?;
            }
        }
        Ok(url)
    }

    fn proxy_for(&self, endpoint: &Endpoint) -> Result<reqwest::Proxy, PoolError> {
        let proxy = reqwest::Proxy::all(self.proxy_url(endpoint)?)
            .map_err(|e| PoolError::probe(&endpoint.id, e))?;
        Ok(match (endpoint.protocol, Self::credentials(endpoint)) {
            (ProtocolKind::Http, Some((user, pass))) => proxy.basic_auth(user, pass),
            _ => proxy,
        })
    }
}

#[async_trait]
impl ProbeTransport for NetProbe {
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), PoolError> {
        let stream = TcpStream::connect((endpoint.address.as_str(), endpoint.port))
            .await
            .map_err(|e| PoolError::transport(&endpoint.id, e))?;
        drop(stream);
        Ok(())
    }

    async fn fetch(&self, endpoint: &Endpoint, url: &str) -> Result<u16, PoolError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .proxy(self.proxy_for(endpoint)?)
            .build()
            .map_err(|e| PoolError::probe(&endpoint.id, e))?;

        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| PoolError::probe(&endpoint.id, e))?;
        Ok(resp.status().as_u16())
    }
}
