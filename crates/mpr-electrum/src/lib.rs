//! mpr-electrum
//!
//! Electrum protocol client used as the verification side of a
//! reconciliation run. Speaks newline-delimited JSON-RPC 2.0 over plain TCP
//! (`t`) or TLS (`s`), multiplexing every in-flight request over a single
//! connection.
//!
//! A record is "found" when `blockchain.transaction.get` returns a result and
//! "not found" when the server answers with an error object.

mod client;
mod connection;
mod tls;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use client::{ElectrumClient, CLIENT_NAME, PROTOCOL_VERSION};

pub const DEFAULT_HOST: &str = "localhost";

/// Transport selector, written `t` (plain TCP) or `s` (TLS) on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    #[default]
    #[serde(rename = "t")]
    Tcp,
    #[serde(rename = "s")]
    Tls,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "t",
            Transport::Tls => "s",
        }
    }

    /// Conventional Electrum port for this transport.
    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tcp => 50001,
            Transport::Tls => 50002,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t" | "tcp" => Ok(Transport::Tcp),
            "s" | "ssl" | "tls" => Ok(Transport::Tls),
            other => Err(format!(
                "invalid electrum transport '{other}'. expected one of: t | s"
            )),
        }
    }
}

/// Electrum server address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectrumEndpoint {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl Default for ElectrumEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, None, Transport::Tcp)
    }
}

impl ElectrumEndpoint {
    /// `port: None` picks the transport's conventional port.
    pub fn new(host: impl Into<String>, port: Option<u16>, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port: port.unwrap_or_else(|| transport.default_port()),
            transport,
        }
    }
}

impl fmt::Display for ElectrumEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.transport)
    }
}
