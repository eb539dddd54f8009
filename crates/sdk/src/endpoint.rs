//! Endpoints, roles and role queries.

use std::{fmt, net::SocketAddr, str::FromStr};

use crate::error::{InvalidEndpointSnafu, SdkError};

/// A `host:port` pair identifying a discovery node or a data node.
///
/// Endpoints compare by value; the same host and port always denote the
/// same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = SdkError;

    /// Parses `host:port`, accepting bracketed IPv6 hosts (`[::1]:26379`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value.rsplit_once(':').ok_or_else(|| {
            InvalidEndpointSnafu { value, message: "expected host:port" }.build()
        })?;
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        if host.is_empty() {
            return InvalidEndpointSnafu { value, message: "host is empty" }.fail();
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| InvalidEndpointSnafu { value, message: "port is not a valid u16" }.build())?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl<S: Into<String>> From<(S, u16)> for Endpoint {
    fn from((host, port): (S, u16)) -> Self {
        Self::new(host, port)
    }
}

/// The role a resolved endpoint must hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Role {
    /// The single writable data node of the cluster.
    #[default]
    Primary,
    /// One of the read-only copies of the primary.
    Replica,
    /// A discovery node itself.
    Discovery,
}

impl Role {
    /// Returns the lowercase role name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::Discovery => "discovery",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SdkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(Self::Primary),
            "replica" | "slave" => Ok(Self::Replica),
            "discovery" | "sentinel" => Ok(Self::Discovery),
            _ => crate::error::ConfigSnafu { message: format!("unknown role '{value}'") }.fail(),
        }
    }
}

/// What a resolution asks the discovery nodes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleQuery {
    /// Requested role.
    pub role: Role,
    /// Name the discovery nodes know the cluster by.
    pub cluster_name: String,
}

impl RoleQuery {
    /// Creates a query.
    #[must_use]
    pub fn new(role: Role, cluster_name: impl Into<String>) -> Self {
        Self { role, cluster_name: cluster_name.into() }
    }
}
