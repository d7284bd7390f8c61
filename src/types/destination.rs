use super::error::ProtocolError;
use url::Url;

/// Identity under which pooled connections are shared: the same host, port
/// and TLS parameters always map to the same pool slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsParams {
    pub server_name: String,
    /// Skips certificate verification. Only meant for test servers.
    pub insecure: bool,
}

impl Destination {
    pub fn cleartext(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
        }
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            tls: Some(TlsParams {
                server_name: host.clone(),
                insecure: false,
            }),
            host,
            port,
        }
    }

    pub fn insecure(mut self) -> Self {
        if let Some(tls) = self.tls.as_mut() {
            tls.insecure = true;
        }
        self
    }

    /// Builds a destination from a URL. `https` and `h2` select TLS, `http`
    /// and `h2c` select prior-knowledge cleartext HTTP/2.
    pub fn parse(target: &str) -> Result<Self, ProtocolError> {
        let url = Url::parse(target)
            .map_err(|e| ProtocolError::InvalidDestination(format!("{} ({})", target, e)))?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<Self, ProtocolError> {
        let host = url.host_str().ok_or_else(|| {
            ProtocolError::InvalidDestination(format!("Target '{}' is missing a host", url))
        })?;

        let (tls, default_port) = match url.scheme() {
            "https" | "h2" => (true, 443),
            "http" | "h2c" => (false, 80),
            other => {
                return Err(ProtocolError::InvalidDestination(format!(
                    "Unsupported scheme for HTTP/2: {}",
                    other
                )))
            }
        };
        let port = url.port().unwrap_or(default_port);

        Ok(if tls {
            Self::tls(host, port)
        } else {
            Self::cleartext(host, port)
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    pub fn authority(&self) -> String {
        let default_port = if self.is_tls() { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}
