//! Rule intents and their iptables rule-spec encoding
//!
//! A [`RuleIntent`] is the logical description of a rule (protocol, source,
//! destination port, action). It encodes deterministically into a [`RuleSpec`],
//! the token sequence handed to the backend, and into a canonical key (the
//! tokens joined by single spaces) used for history and existence checks.
//!
//! # Example
//!
//! ```
//! use tabserv::core::rule::RuleIntent;
//!
//! let intent = RuleIntent::drop_tcp("10.0.0.1", 8080).unwrap();
//! assert_eq!(intent.canonical_key(), "-p tcp -s 10.0.0.1 --dport 8080 -j DROP");
//! assert_eq!(
//!     intent.spec().format_append("INPUT"),
//!     "-A INPUT [-p tcp -s 10.0.0.1 --dport 8080 -j DROP]"
//! );
//! ```

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Table every rule is installed into
pub const DEFAULT_TABLE: &str = "filter";

/// Chain every rule is appended to
pub const DEFAULT_CHAIN: &str = "INPUT";

/// Network protocol matched by a rule
///
/// Only TCP is produced today; the string form doubles as the event topic.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
        }
    }

    /// Event hub topic for changes to rules of this protocol
    pub const fn topic(self) -> &'static str {
        self.as_str()
    }
}

/// Rule target
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Action {
    /// Drop the packet silently (no response sent)
    #[default]
    #[strum(serialize = "DROP")]
    Drop,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Drop => "DROP",
        }
    }
}

/// Logical description of a single firewall rule
///
/// Deserializing goes through [`RuleIntent::new`], so a decoded intent is
/// validated exactly like one built in code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRuleIntent")]
pub struct RuleIntent {
    protocol: Protocol,
    source: String,
    destination_port: u16,
    action: Action,
}

impl RuleIntent {
    /// Builds a validated intent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the source is not an IP address or
    /// CIDR network, or if the port is 0.
    pub fn new(
        protocol: Protocol,
        source: &str,
        destination_port: u16,
        action: Action,
    ) -> Result<Self> {
        let source = source.trim();
        crate::validators::validate_source_address(source)
            .map_err(|e| Error::validation("source_address", e))?;
        crate::validators::validate_port(destination_port)
            .map_err(|e| Error::validation("destination_port", e))?;

        Ok(Self {
            protocol,
            source: source.to_string(),
            destination_port,
            action,
        })
    }

    /// Shorthand for the only rule shape the service exposes today.
    pub fn drop_tcp(source: &str, destination_port: u16) -> Result<Self> {
        Self::new(Protocol::Tcp, source, destination_port, Action::Drop)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// Encodes the intent as backend tokens.
    pub fn spec(&self) -> RuleSpec {
        RuleSpec(vec![
            "-p".to_string(),
            self.protocol.as_str().to_string(),
            "-s".to_string(),
            self.source.clone(),
            "--dport".to_string(),
            self.destination_port.to_string(),
            "-j".to_string(),
            self.action.as_str().to_string(),
        ])
    }

    /// Canonical key: spec tokens joined by single spaces.
    pub fn canonical_key(&self) -> String {
        self.spec().key()
    }
}

#[derive(Deserialize)]
struct RawRuleIntent {
    protocol: Protocol,
    source: String,
    destination_port: u16,
    action: Action,
}

impl TryFrom<RawRuleIntent> for RuleIntent {
    type Error = Error;

    fn try_from(raw: RawRuleIntent) -> Result<Self> {
        Self::new(raw.protocol, &raw.source, raw.destination_port, raw.action)
    }
}

impl fmt::Display for RuleIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_key())
    }
}

/// Ordered iptables rule-spec tokens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    /// Rebuilds a spec from a canonical key by splitting on whitespace.
    ///
    /// Returns `None` for a key with no tokens.
    pub fn from_key(key: &str) -> Option<Self> {
        let tokens: Vec<String> = key.split_whitespace().map(String::from).collect();
        if tokens.is_empty() {
            None
        } else {
            Some(Self(tokens))
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn key(&self) -> String {
        self.0.join(" ")
    }

    /// `-A <chain> [<tokens>]`, as reported for a successful add
    pub fn format_append(&self, chain: &str) -> String {
        format!("-A {chain} [{}]", self.key())
    }

    /// `-D <chain> [<tokens>]`, as reported for a successful delete
    pub fn format_delete(&self, chain: &str) -> String {
        format!("-D {chain} [{}]", self.key())
    }
}

/// Listing line for an active rule: `-A <chain> <key>`
pub fn format_listing(chain: &str, key: &str) -> String {
    format!("-A {chain} {key}")
}
