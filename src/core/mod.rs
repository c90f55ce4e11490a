//! Core rule management
//!
//! - [`rule`]: Rule intents, rule-spec encoding and canonical keys
//! - [`backend`]: The packet-filter capability (`iptables` or in-memory)
//! - [`history`]: Append-only record of every rule ever added
//! - [`events`]: Per-topic broadcast of rule changes to live subscribers
//! - [`engine`]: Add/delete/list semantics tying the above together
//! - [`locks`]: Per-rule serialization of mutations
//! - [`error`]: Error types and status mapping

pub mod backend;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod locks;
pub mod rule;

#[cfg(test)]
pub mod test_helpers;
