//! Transport protocol tags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TypeError;

/// The link-layer protocol an endpoint communicates over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Reliable stream sockets.
    Tcp,
    /// Long-range datagram radio.
    LoRa,
    /// Stream bridge to an attached co-processor.
    Bridge,
}

impl Protocol {
    /// All protocols the runtime can drive.
    pub const ALL: &'static [Protocol] = &[Protocol::Tcp, Protocol::LoRa, Protocol::Bridge];

    /// The lowercase tag used in URIs and the bootstrap file.
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::LoRa => "lora",
            Protocol::Bridge => "bridge",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Protocol {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "lora" => Ok(Protocol::LoRa),
            "bridge" => Ok(Protocol::Bridge),
            other => Err(TypeError::UnknownProtocol(other.to_string())),
        }
    }
}
