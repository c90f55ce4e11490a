//! tabserv - firewall drop-rule manager
//!
//! Installs and removes TCP drop rules on one iptables chain, remembers every
//! rule it has ever installed, and broadcasts rule changes to live
//! subscribers.
//!
//! # Architecture
//!
//! - [`core`] - Rule codec, history store, rule engine, event hub and the
//!   firewall backends
//! - [`service`] - Facade mapping caller requests onto the engine and hub
//! - [`shell`] - Line-oriented command front end and demo session
//! - [`audit`] - JSON-lines audit log of rule changes
//! - [`validators`] - Input validation for addresses, ports and topics
//! - [`elevation`] - Privilege escalation for iptables
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Consistency
//!
//! - The backend is the source of truth for whether a rule exists
//! - History is append-only and volatile
//! - Subscribers get best-effort delivery through bounded queues

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod service;
pub mod shell;
pub mod utils;
pub mod validators;

/// Default iptables binary. Packagers can override it at build time with
/// `TABSERV_SYSTEM_IPTABLES_PATH`.
pub const SYSTEM_IPTABLES_PATH: &str = match option_env!("TABSERV_SYSTEM_IPTABLES_PATH") {
    Some(path) => path,
    None => "/usr/sbin/iptables",
};

// Re-export commonly used types
pub use core::error::{Error, Result, StatusCode};
pub use core::events::{ChangeEvent, ChangeKind, EventHub, Subscription};
pub use core::rule::RuleIntent;
pub use service::{AddResponse, DeleteResponse, RuleService};
