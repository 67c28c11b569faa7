//! Minimal SIP URI model.
//!
//! Carries the fields the call engine routes on. This is an address value,
//! not a grammar: `parse` accepts the `scheme:user@host:port` shape that
//! dial strings and configuration supply, nothing more.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SipTypesError;

/// URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// Plain SIP.
    Sip,
    /// SIP over TLS.
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP address: `sip:user@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Uri {
    /// New SIP URI for a bare host.
    pub fn sip(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
        }
    }

    /// New SIPS URI for a bare host.
    pub fn sips(host: impl Into<String>) -> Self {
        Uri {
            scheme: Scheme::Sips,
            user: None,
            host: host.into(),
            port: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Parse a dial string of the form `sip:alice@example.com:5060`.
    ///
    /// The scheme prefix is optional; a bare `alice@example.com` is taken
    /// as plain SIP. Angle brackets from copied name-addr forms are
    /// tolerated and stripped.
    pub fn parse(input: &str) -> Result<Self, SipTypesError> {
        let trimmed = input.trim().trim_start_matches('<').trim_end_matches('>');
        if trimmed.is_empty() {
            return Err(SipTypesError::InvalidUri {
                uri: input.to_string(),
            });
        }

        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = trimmed.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            (Scheme::Sip, trimmed)
        };

        // Anything after ';' or '?' is a parameter or header we do not model.
        let rest = rest.split([';', '?']).next().unwrap_or(rest);

        let (user, host_port) = match rest.split_once('@') {
            Some((user, host_port)) => {
                if user.is_empty() {
                    return Err(SipTypesError::InvalidUri {
                        uri: input.to_string(),
                    });
                }
                (Some(user.to_string()), host_port)
            }
            None => (None, rest),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port_str)) if !port_str.is_empty() && !host.contains(':') => {
                let port = port_str.parse::<u16>().map_err(|_| SipTypesError::InvalidUri {
                    uri: input.to_string(),
                })?;
                (host.to_string(), Some(port))
            }
            _ => (host_port.to_string(), None),
        };

        if host.is_empty() {
            return Err(SipTypesError::InvalidUri {
                uri: input.to_string(),
            });
        }

        Ok(Uri {
            scheme,
            user,
            host,
            port,
        })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = SipTypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::parse(s)
    }
}
