//! Streaming endpoint parsing
//!
//! Everything here runs before any network I/O: a malformed target is
//! rejected with `InvalidEndpoint` and never reaches a publisher.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtmp,
    Rtmps,
    Rtsp,
    Rtsps,
    Srt,
    Udp,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "rtmp" => Some(Self::Rtmp),
            "rtmps" => Some(Self::Rtmps),
            "rtsp" => Some(Self::Rtsp),
            "rtsps" => Some(Self::Rtsps),
            "srt" => Some(Self::Srt),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Rtmp => "rtmp",
            Self::Rtmps => "rtmps",
            Self::Rtsp => "rtsp",
            Self::Rtsps => "rtsps",
            Self::Srt => "srt",
            Self::Udp => "udp",
        }
    }

    /// Port used when the URL has none
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Rtmp => Some(1935),
            Self::Rtmps => Some(443),
            Self::Rtsp => Some(554),
            Self::Rtsps => Some(322),
            Self::Srt | Self::Udp => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A validated publish target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingEndpoint {
    pub protocol: Protocol,
    /// Server URL without the stream key
    pub url: String,
    pub key: String,
    pub host: String,
    pub port: u16,
    /// Path after the authority, without leading or trailing slashes
    pub path: String,
    pub credentials: Option<(String, String)>,
}

impl StreamingEndpoint {
    /// Validate a server URL and stream key
    pub fn parse(url: &str, key: &str) -> Result<Self> {
        if url.is_empty() {
            return Err(AppError::InvalidEndpoint("empty url".to_string()));
        }
        if url.chars().any(char::is_whitespace) {
            return Err(AppError::InvalidEndpoint(
                "url contains whitespace".to_string(),
            ));
        }
        if key.trim().is_empty() {
            return Err(AppError::InvalidEndpoint("stream key is blank".to_string()));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(AppError::InvalidEndpoint(
                "stream key contains whitespace".to_string(),
            ));
        }

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| AppError::InvalidEndpoint(format!("missing scheme in {}", url)))?;
        let protocol = Protocol::from_scheme(scheme)
            .ok_or_else(|| AppError::InvalidEndpoint(format!("unknown scheme {}", scheme)))?;

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let (user, pass) = userinfo.split_once(':').unwrap_or((userinfo, ""));
                (Some((user.to_string(), pass.to_string())), host_port)
            }
            None => (None, authority),
        };
        let (host, port) = split_host_port(host_port, protocol)?;

        Ok(Self {
            protocol,
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            host,
            port,
            path: path.trim_matches('/').to_string(),
            credentials,
        })
    }

    /// Full publish target: `url/key`
    pub fn target(&self) -> String {
        format!("{}/{}", self.url, self.key)
    }

    /// `host:port` for socket connects
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// URL safe to log: credentials removed, key never included
    pub fn redacted(&self) -> String {
        match &self.credentials {
            Some(_) => {
                let path = if self.path.is_empty() {
                    String::new()
                } else {
                    format!("/{}", self.path)
                };
                format!("{}://{}{}", self.protocol, self.address(), path)
            }
            None => self.url.clone(),
        }
    }
}

impl fmt::Display for StreamingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

fn split_host_port(host_port: &str, protocol: Protocol) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| AppError::InvalidEndpoint(format!("bad IPv6 host {}", host_port)))?;
        (host, after.strip_prefix(':'))
    } else {
        match host_port.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (host_port, None),
        }
    };

    if host.is_empty() {
        return Err(AppError::InvalidEndpoint("missing host".to_string()));
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| AppError::InvalidEndpoint(format!("bad port {}", port)))?,
        None => protocol.default_port().ok_or_else(|| {
            AppError::InvalidEndpoint(format!("{} urls need an explicit port", protocol))
        })?,
    };
    Ok((host.to_string(), port))
}
