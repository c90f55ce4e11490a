use thiserror::Error;

/// Core error types for tabserv
#[derive(Debug, Error)]
pub enum Error {
    /// The rule intent is malformed (bad address, port 0, ...)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Add was requested for a rule the backend already has
    #[error("rule already exists: {0}")]
    AlreadyExists(String),

    /// Delete was requested for a rule the backend does not have
    #[error("rule not found: {0}")]
    NotFound(String),

    /// A firewall backend call failed
    #[error("backend {op} failed: {message}")]
    Backend {
        op: &'static str,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The history store could not be read or written
    #[error("history error: {0}")]
    History(String),

    /// A streamed message could not be delivered to the caller
    #[error("stream unavailable: {0}")]
    Unavailable(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),
}

/// Externally visible outcome categories
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    AlreadyExists,
    NotFound,
    Internal,
    Unavailable,
}

impl Error {
    /// Maps an error onto the category reported to callers.
    ///
    /// Backend, history and local I/O failures all collapse into `Internal`;
    /// callers may retry those.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::InvalidArgument,
            Error::AlreadyExists(_) => StatusCode::AlreadyExists,
            Error::NotFound(_) => StatusCode::NotFound,
            Error::Unavailable(_) => StatusCode::Unavailable,
            Error::Backend { .. }
            | Error::History(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Elevation(_) => StatusCode::Internal,
        }
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an iptables stderr message against known patterns and returns a
    /// user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run tabserv as root or configure TABSERV_ELEVATION_METHOD")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or set iptables_path in config.json");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        // Chain or table missing
        if lower.contains("no chain/target/match by that name")
            || lower.contains("table does not exist")
        {
            return ErrorTranslation::new("Firewall chain or table not found")
                .with_suggestion("Verify the configured table and chain exist: iptables -L -n");
        }

        // Bad host or port argument
        if lower.contains("host/network") || lower.contains("invalid port") {
            return ErrorTranslation::new("Invalid address or port in rule")
                .with_suggestion("Use proper IP format: 192.168.1.1 or 192.168.1.0/24")
                .with_suggestion("Port numbers must be between 1 and 65535");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Verify iptables is working: sudo iptables -L -n")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
