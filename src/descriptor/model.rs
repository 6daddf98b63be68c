use std::collections::HashMap;
use std::fmt;

/// Transport declared by the `type` query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportType {
    Tcp,
    WebSocket,
    HttpUpgrade,
    /// Any other transport name (grpc, xhttp, ...), kept verbatim.
    Other(String),
}

impl TransportType {
    pub fn from_param(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => TransportType::Tcp,
            "ws" | "websocket" => TransportType::WebSocket,
            "httpupgrade" => TransportType::HttpUpgrade,
            _ => TransportType::Other(value.to_string()),
        }
    }

    /// Transports that start with a plain HTTP/1.1 request and can therefore
    /// answer a HEAD request on their path.
    pub fn is_http_upgradeable(&self) -> bool {
        matches!(self, TransportType::WebSocket | TransportType::HttpUpgrade)
    }

    /// Network name as understood by proxy runtimes.
    pub fn as_str(&self) -> &str {
        match self {
            TransportType::Tcp => "tcp",
            TransportType::WebSocket => "ws",
            TransportType::HttpUpgrade => "httpupgrade",
            TransportType::Other(name) => name,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn from_param(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "none" => Some(Security::None),
            "tls" => Some(Security::Tls),
            "reality" => Some(Security::Reality),
            _ => None,
        }
    }

    /// Both TLS and Reality open with a regular TLS handshake on the wire.
    pub fn requires_handshake(self) -> bool {
        !matches!(self, Security::None)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

/// One proxy endpoint, as parsed from a `vless://` descriptor line.
///
/// Only the parser constructs these, so `host` is always non-empty and
/// `port` is never zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub identity: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
    pub security: Security,
    pub server_name: Option<String>,
    pub path: String,
    pub label: Option<String>,
    pub params: HashMap<String, Vec<String>>,
    pub raw_text: String,
}

impl EndpointDescriptor {
    /// First value of a query parameter, empty values treated as absent.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Name presented as SNI and checked against the certificate.
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Host header used by HTTP-upgradeable transports.
    pub fn http_host(&self) -> &str {
        self.param("host").unwrap_or_else(|| self.tls_server_name())
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.param("fp")
    }

    pub fn public_key(&self) -> Option<&str> {
        self.param("pbk")
    }

    pub fn short_id(&self) -> Option<&str> {
        self.param("sid")
    }

    pub fn spider_x(&self) -> Option<&str> {
        self.param("spx")
    }

    pub fn flow(&self) -> Option<&str> {
        self.param("flow")
    }

    pub fn alpn(&self) -> Vec<String> {
        self.param("alpn")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mux_enabled(&self) -> bool {
        self.param("mux") == Some("1")
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
