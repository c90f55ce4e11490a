//! Privilege elevation for iptables invocations
//!
//! tabserv normally runs as root, in which case iptables is spawned directly.
//! When it does not, every backend call goes through an elevation helper.
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal fallback**: `sudo`
//! - **Headless fallback**: `pkexec`
//!
//! # Environment Variables
//!
//! - `TABSERV_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//!   Useful with sudoers NOPASSWD rules.
//! - `TABSERV_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Arguments are passed directly without shell interpolation
//! - Rule tokens are validated before they reach this module
//! - Helper binaries are checked for availability

use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `TABSERV_ELEVATION_METHOD`
    #[error("Invalid TABSERV_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(helper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Test mode override
    if std::env::var("TABSERV_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(program, args));
    }

    // 2. Already root
    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    // 3. Explicit method
    if let Ok(method) = std::env::var("TABSERV_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else {
        if !binary_exists("pkexec") {
            return Err(ElevationError::PkexecNotFound);
        }
        Ok(wrapped("pkexec", program, args))
    }
}

/// Creates an `iptables` command, elevated if `elevate` is set.
///
/// `program` is the iptables binary (name or absolute path). Arguments are
/// passed through verbatim.
///
/// # Example
///
/// ```no_run
/// use tabserv::elevation::create_iptables_command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_iptables_command("iptables", &["-w", "-t", "filter", "-S", "INPUT"], true)?;
/// let output = cmd.output().await?;
/// # Ok(())
/// # }
/// ```
pub fn create_iptables_command(
    program: &str,
    args: &[&str],
    elevate: bool,
) -> Result<Command, ElevationError> {
    if elevate {
        build_elevated_command(program, args)
    } else {
        Ok(direct(program, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        assert!(binary_exists("sh"));
        assert!(!binary_exists("tabserv_nonexistent_binary_xyz"));
    }

    #[test]
    fn test_direct_command_when_not_elevating() {
        let cmd = create_iptables_command("iptables", &["-L"], false).unwrap();
        assert_eq!(cmd.as_std().get_program(), "iptables");
    }

    #[tokio::test]
    async fn test_create_command_test_mode() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        unsafe {
            std::env::set_var("TABSERV_TEST_NO_ELEVATION", "1");
        }

        let cmd = create_iptables_command("iptables", &["-L"], true).unwrap();
        assert_eq!(cmd.as_std().get_program(), "iptables");

        unsafe {
            std::env::remove_var("TABSERV_TEST_NO_ELEVATION");
        }
    }

    #[test]
    fn test_invalid_elevation_method() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if nix::unistd::getuid().is_root() {
            // Root never consults the method override
            return;
        }

        unsafe {
            std::env::remove_var("TABSERV_TEST_NO_ELEVATION");
            std::env::set_var("TABSERV_ELEVATION_METHOD", "invalid_method");
        }

        let result = create_iptables_command("iptables", &["-L"], true);

        unsafe {
            std::env::remove_var("TABSERV_ELEVATION_METHOD");
        }

        assert!(matches!(result, Err(ElevationError::InvalidMethod(_))));
    }

    #[test]
    fn test_elevation_method_case_insensitive() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        unsafe {
            std::env::remove_var("TABSERV_TEST_NO_ELEVATION");
            std::env::set_var("TABSERV_ELEVATION_METHOD", "SUDO");
        }

        let result = create_iptables_command("iptables", &["-L"], true);

        unsafe {
            std::env::remove_var("TABSERV_ELEVATION_METHOD");
        }

        // Either sudo is usable or it is missing, but the name is never invalid
        assert!(!matches!(result, Err(ElevationError::InvalidMethod(_))));
    }
}
