//! Endpoint descriptions
//!
//! ```text
//! tcp -h <host> -p <port> [-t <ms>]
//! local -f <path> [-t <ms>]
//! default [options...]      protocol taken from Rpc.Default.Protocol
//! ```
//!
//! `-t -1` or no `-t` means no timeout.

use std::fmt;

use crate::common::{Error, Properties, Result};

/// Supported transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Local,
}

impl Protocol {
    /// Parse a protocol name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Self::Tcp),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Local => "local",
        }
    }
}

/// Defaults applied while parsing endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDefaults {
    /// Protocol used for `default` endpoints
    pub protocol: Protocol,
    /// Host used when `-h` is absent
    pub host: String,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl EndpointDefaults {
    /// Read `Rpc.Default.Protocol` and `Rpc.Default.Host`
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Self::default();
        let protocol = match props.get("Rpc.Default.Protocol") {
            Some(name) => Protocol::parse(name).ok_or_else(|| {
                Error::property_parse("Rpc.Default.Protocol", name, "'tcp' or 'local'")
            })?,
            None => defaults.protocol,
        };
        let host = props.get_or("Rpc.Default.Host", &defaults.host).to_string();
        Ok(Self { protocol, host })
    }
}

/// A transport endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Tcp {
        host: String,
        port: u16,
        timeout: Option<u64>,
    },
    Local {
        path: String,
        timeout: Option<u64>,
    },
}

impl Endpoint {
    /// Parse an endpoint with the built-in defaults
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_with(s, &EndpointDefaults::default())
    }

    /// Parse an endpoint, filling gaps from `defaults`
    pub fn parse_with(s: &str, defaults: &EndpointDefaults) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        let protocol = match tokens.next() {
            Some("default") => defaults.protocol,
            Some(name) => Protocol::parse(name)
                .ok_or_else(|| Error::endpoint_parse(s, format!("unknown protocol '{name}'")))?,
            None => return Err(Error::endpoint_parse(s, "empty endpoint")),
        };

        let mut host = None;
        let mut port = None;
        let mut path = None;
        let mut timeout = None;

        while let Some(option) = tokens.next() {
            let value = tokens.next().ok_or_else(|| {
                Error::endpoint_parse(s, format!("no argument for option {option}"))
            })?;
            match (protocol, option) {
                (Protocol::Tcp, "-h") => host = Some(value.to_string()),
                (Protocol::Tcp, "-p") => {
                    port = Some(value.parse::<u16>().map_err(|_| {
                        Error::endpoint_parse(s, format!("invalid port value '{value}'"))
                    })?)
                }
                (Protocol::Local, "-f") => path = Some(value.to_string()),
                (_, "-t") => timeout = parse_timeout(s, value)?,
                _ => {
                    return Err(Error::endpoint_parse(
                        s,
                        format!("unknown option '{option}' for {} endpoint", protocol.as_str()),
                    ))
                }
            }
        }

        match protocol {
            Protocol::Tcp => Ok(Self::Tcp {
                host: host.unwrap_or_else(|| defaults.host.clone()),
                port: port.unwrap_or(0),
                timeout,
            }),
            Protocol::Local => Ok(Self::Local {
                path: path.ok_or_else(|| Error::endpoint_parse(s, "local endpoint requires -f"))?,
                timeout,
            }),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Tcp { .. } => Protocol::Tcp,
            Self::Local { .. } => Protocol::Local,
        }
    }

    /// Timeout in milliseconds, `None` for no timeout
    pub fn timeout(&self) -> Option<u64> {
        match self {
            Self::Tcp { timeout, .. } | Self::Local { timeout, .. } => *timeout,
        }
    }

    /// Copy of this endpoint with a different timeout
    pub fn with_timeout(&self, value: Option<u64>) -> Self {
        let mut endpoint = self.clone();
        match &mut endpoint {
            Self::Tcp { timeout, .. } | Self::Local { timeout, .. } => *timeout = value,
        }
        endpoint
    }

    /// Copy of a TCP endpoint with a resolved port
    pub fn with_port(&self, value: u16) -> Self {
        let mut endpoint = self.clone();
        if let Self::Tcp { port, .. } = &mut endpoint {
            *port = value;
        }
        endpoint
    }

    /// Whether two endpoints address the same transport target, ignoring timeouts
    pub fn same_address(&self, other: &Endpoint) -> bool {
        self.with_timeout(None) == other.with_timeout(None)
    }
}

fn parse_timeout(input: &str, value: &str) -> Result<Option<u64>> {
    if value == "-1" || value == "infinite" {
        return Ok(None);
    }
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Some(ms)),
        _ => Err(Error::endpoint_parse(input, format!("invalid timeout value '{value}'"))),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port, .. } => write!(f, "tcp -h {host} -p {port}")?,
            Self::Local { path, .. } => write!(f, "local -f {path}")?,
        }
        if let Some(timeout) = self.timeout() {
            write!(f, " -t {timeout}")?;
        }
        Ok(())
    }
}
