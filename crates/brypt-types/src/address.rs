//! Network addresses and the URI grammar.
//!
//! Addresses are carried as `<protocol>://<authority>` where the authority
//! is `<host>:<port>` for stream protocols and `<freq>:<channel>` for
//! radio. A binding authority may use the wildcard host `*` to bind all
//! interfaces; the wildcard is rewritten to a concrete interface before an
//! address is handed to a client-side connect.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Protocol, Result, TypeError};

/// The host used when a wildcard binding must be advertised to peers.
pub const WILDCARD_HOST: &str = "*";

fn split_authority(uri: &str) -> Result<(Protocol, &str)> {
    let (scheme, authority) = uri
        .split_once("://")
        .ok_or_else(|| TypeError::MalformedUri(uri.to_string()))?;
    let protocol: Protocol = scheme.parse()?;

    match authority.split_once(':') {
        Some((primary, secondary)) if !primary.is_empty() && !secondary.is_empty() => {
            Ok((protocol, authority))
        }
        _ => Err(TypeError::MalformedUri(uri.to_string())),
    }
}

/// An address a server endpoint binds to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingAddress {
    protocol: Protocol,
    authority: String,
}

impl BindingAddress {
    /// Build from a protocol and an `<host>:<port>` authority component.
    pub fn new(protocol: Protocol, authority: &str) -> Result<Self> {
        let uri = format!("{}://{authority}", protocol.tag());
        let (protocol, authority) = split_authority(&uri)?;
        Ok(Self {
            protocol,
            authority: authority.to_string(),
        })
    }

    /// Parse from a full `<protocol>://<authority>` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (protocol, authority) = split_authority(uri)?;
        Ok(Self {
            protocol,
            authority: authority.to_string(),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The `<host>:<port>` (or `<freq>:<channel>`) component.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Whether the binding requests all local interfaces.
    pub fn is_wildcard(&self) -> bool {
        self.authority
            .split_once(':')
            .is_some_and(|(host, _)| host == WILDCARD_HOST)
    }

    /// The full URI string.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.protocol.tag(), self.authority)
    }

    /// Derive the remote address peers should connect to, substituting a
    /// concrete interface for a wildcard host.
    pub fn to_remote(&self, interface: &str) -> Result<RemoteAddress> {
        let authority = match self.authority.split_once(':') {
            Some((host, secondary)) if host == WILDCARD_HOST => {
                format!("{interface}:{secondary}")
            }
            _ => self.authority.clone(),
        };
        RemoteAddress::new(self.protocol, &authority)
    }
}

impl fmt::Display for BindingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.tag(), self.authority)
    }
}

/// The address of a remote peer's endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteAddress {
    protocol: Protocol,
    authority: String,
}

impl RemoteAddress {
    /// Build from a protocol and an `<host>:<port>` authority component.
    ///
    /// A wildcard host is rejected: connect targets must be concrete.
    pub fn new(protocol: Protocol, authority: &str) -> Result<Self> {
        let uri = format!("{}://{authority}", protocol.tag());
        Self::from_uri(&uri)
    }

    /// Parse from a full `<protocol>://<authority>` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (protocol, authority) = split_authority(uri)?;
        if authority
            .split_once(':')
            .is_some_and(|(host, _)| host == WILDCARD_HOST)
        {
            return Err(TypeError::MalformedUri(uri.to_string()));
        }
        Ok(Self {
            protocol,
            authority: authority.to_string(),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The `<host>:<port>` (or `<freq>:<channel>`) component.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The full URI string.
    pub fn uri(&self) -> String {
        format!("{}://{}", self.protocol.tag(), self.authority)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol.tag(), self.authority)
    }
}
