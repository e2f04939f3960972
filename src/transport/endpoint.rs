//! Endpoint resolver
//!
//! Endpoints are written `scheme://host:port`. The scheme defaults to `tcp`
//! and `ws` is accepted as a synonym; both carry WebSocket framing over TCP.
//! A port of `random` asks the listener to pick any free port, and the
//! resolved endpoint reports the port that was actually bound.

use std::fmt;
use std::str::FromStr;

use tokio::net::TcpListener;

use crate::utils::{BusError, Result};

/// Template token substituted with the broker's bind interface.
pub const BIND_INTERFACE_TOKEN: &str = "{bindInterface}";
/// Template token substituted with the host where the broker runs.
pub const CENTRAL_HOST_TOKEN: &str = "{centralHost}";

const RANDOM_PORT: &str = "random";
const SCHEMES: [&str; 2] = ["tcp", "ws"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Fixed(u16),
    Random,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Fixed(port) => write!(f, "{port}"),
            Port::Random => f.write_str(RANDOM_PORT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: Port,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: Port) -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: host.into(),
            port,
        }
    }

    /// Parse an endpoint, filling in `default_port` when none is given.
    pub fn parse_with_default(text: &str, default_port: Option<Port>) -> Result<Self> {
        let invalid = |reason: &str| BusError::Endpoint {
            endpoint: text.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = match text.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("tcp".to_string(), text),
        };
        if !SCHEMES.contains(&scheme.as_str()) {
            return Err(invalid("unsupported transport scheme"));
        }
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() => (host, Some(port)),
            Some((host, _)) => (host, None),
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if host.contains('{') {
            return Err(invalid("unexpanded template token"));
        }

        let port = match port {
            Some(RANDOM_PORT) => Port::Random,
            Some(port) => Port::Fixed(port.parse().map_err(|_| invalid("invalid port"))?),
            None => default_port.ok_or_else(|| invalid("missing port"))?,
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn is_random(&self) -> bool {
        self.port == Port::Random
    }

    /// Address for `TcpListener::bind`; `*` means every interface.
    fn bind_addr(&self) -> String {
        let host = if self.host == "*" { "0.0.0.0" } else { &self.host };
        let port = match self.port {
            Port::Fixed(port) => port,
            Port::Random => 0,
        };
        format!("{host}:{port}")
    }

    /// Bind a listener, returning it with the endpoint it actually bound.
    pub async fn bind(&self) -> Result<(TcpListener, Endpoint)> {
        let listener = TcpListener::bind(self.bind_addr())
            .await
            .map_err(|source| BusError::Bind {
                endpoint: self.to_string(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| BusError::Bind {
                endpoint: self.to_string(),
                source,
            })?
            .port();
        let resolved = Endpoint {
            scheme: self.scheme.clone(),
            host: self.host.clone(),
            port: Port::Fixed(port),
        };
        Ok((listener, resolved))
    }

    /// WebSocket URL used to connect to this endpoint.
    pub fn ws_url(&self) -> Result<String> {
        match self.port {
            Port::Fixed(port) => {
                let host = if self.host == "*" { "127.0.0.1" } else { &self.host };
                Ok(format!("ws://{host}:{port}/"))
            }
            Port::Random => Err(BusError::Endpoint {
                endpoint: self.to_string(),
                reason: "cannot connect to an unresolved random port".to_string(),
            }),
        }
    }
}

impl FromStr for Endpoint {
    type Err = BusError;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse_with_default(text, None)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Substitute a `{token}` in an endpoint template.
pub fn expand(template: &str, token: &str, value: &str) -> String {
    template.replace(token, value)
}
