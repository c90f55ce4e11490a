//! Firewall backend capability
//!
//! The engine only needs three questions answered by the packet filter: does a
//! rule exist, append it, delete it. [`IptablesBackend`] shells out to
//! `iptables`; [`MemoryBackend`] keeps an in-process table for dry runs and
//! tests.

use crate::core::error::{Error, IptablesErrorPattern, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Rule programming operations on one `(table, chain)` pair
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool>;

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;

    /// Deletes the first rule matching `spec`.
    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;
}

/// Exit status `iptables -C` uses for "no matching rule"
const EXIT_RULE_MISSING: i32 = 1;

/// Backend driving the `iptables` binary
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    program: String,
    wait_for_lock: bool,
    elevate: bool,
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            wait_for_lock: true,
            elevate: true,
            timeout: Duration::from_secs(10),
        }
    }

    /// Route invocations through sudo/run0/pkexec when not running as root.
    pub fn with_elevation(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// Pass `-w` so concurrent iptables invocations queue on the xtables lock.
    pub fn with_wait_for_lock(mut self, wait: bool) -> Self {
        self.wait_for_lock = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args<'a>(
        &self,
        flag: &'a str,
        table: &'a str,
        chain: &'a str,
        spec: &'a [String],
    ) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(spec.len() + 5);
        if self.wait_for_lock {
            args.push("-w");
        }
        args.extend(["-t", table, flag, chain]);
        args.extend(spec.iter().map(String::as_str));
        args
    }

    async fn run(&self, op: &'static str, args: &[&str]) -> Result<std::process::Output> {
        debug!("{} {}", self.program, args.join(" "));

        let mut cmd =
            crate::elevation::create_iptables_command(&self.program, args, self.elevate)?;
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {e}", self.program);
            Error::Backend {
                op,
                message: IptablesErrorPattern::match_error(&e.to_string()).user_message,
                stderr: None,
                exit_code: None,
            }
        })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(Error::Backend {
                op,
                message: format!("timed out after {}s", self.timeout.as_secs()),
                stderr: None,
                exit_code: None,
            }),
        }
    }

    fn failure(op: &'static str, output: &std::process::Output) -> Error {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let translation = IptablesErrorPattern::match_error(&stderr);
        warn!("iptables {op} failed: {stderr}");
        for suggestion in &translation.suggestions {
            debug!("  hint: {suggestion}");
        }
        Error::Backend {
            op,
            message: translation.user_message,
            stderr: Some(stderr),
            exit_code: output.status.code(),
        }
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        let args = self.build_args("-C", table, chain, spec);
        let output = self.run("exists", &args).await?;

        if output.status.success() {
            Ok(true)
        } else if output.status.code() == Some(EXIT_RULE_MISSING) {
            Ok(false)
        } else {
            Err(Self::failure("exists", &output))
        }
    }

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let args = self.build_args("-A", table, chain, spec);
        let output = self.run("append", &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::failure("append", &output))
        }
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let args = self.build_args("-D", table, chain, spec);
        let output = self.run("delete", &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::failure("delete", &output))
        }
    }
}

type ChainKey = (String, String);

/// In-process rule table with iptables append/delete semantics
#[derive(Debug, Default)]
pub struct MemoryBackend {
    chains: Mutex<HashMap<ChainKey, Vec<Vec<String>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules currently installed in `(table, chain)`, in append order.
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.chains
            .lock()
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_count(&self) -> usize {
        self.chains.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl FirewallBackend for MemoryBackend {
    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        Ok(self
            .chains
            .lock()
            .get(&(table.to_string(), chain.to_string()))
            .is_some_and(|rules| rules.iter().any(|r| r == spec)))
    }

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        self.chains
            .lock()
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(spec.to_vec());
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let missing = || Error::Backend {
            op: "delete",
            message: "Bad rule (does a matching rule exist in that chain?)".to_string(),
            stderr: None,
            exit_code: Some(EXIT_RULE_MISSING),
        };

        let mut chains = self.chains.lock();
        let Some(rules) = chains.get_mut(&(table.to_string(), chain.to_string())) else {
            return Err(missing());
        };
        let Some(index) = rules.iter().position(|r| r == spec) else {
            return Err(missing());
        };
        rules.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(src: &str) -> Vec<String> {
        ["-p", "tcp", "-s", src, "--dport", "22", "-j", "DROP"]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_memory_backend_lifecycle() {
        let backend = MemoryBackend::new();
        let rule = spec("10.0.0.1");

        assert!(!backend.exists("filter", "INPUT", &rule).await.unwrap());
        backend.append("filter", "INPUT", &rule).await.unwrap();
        assert!(backend.exists("filter", "INPUT", &rule).await.unwrap());
        assert!(!backend.exists("filter", "OUTPUT", &rule).await.unwrap());

        backend.delete("filter", "INPUT", &rule).await.unwrap();
        assert!(!backend.exists("filter", "INPUT", &rule).await.unwrap());
        assert_eq!(backend.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_backend_delete_missing() {
        let backend = MemoryBackend::new();
        let err = backend
            .delete("filter", "INPUT", &spec("10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { op: "delete", .. }));
    }

    #[tokio::test]
    async fn test_memory_backend_delete_removes_first_duplicate() {
        let backend = MemoryBackend::new();
        let rule = spec("10.0.0.1");
        backend.append("filter", "INPUT", &rule).await.unwrap();
        backend.append("filter", "INPUT", &rule).await.unwrap();

        backend.delete("filter", "INPUT", &rule).await.unwrap();
        assert_eq!(backend.rules("filter", "INPUT").len(), 1);
    }

    #[test]
    fn test_iptables_args() {
        let backend = IptablesBackend::new("iptables");
        let rule = spec("10.0.0.1");
        let args = backend.build_args("-C", "filter", "INPUT", &rule);
        assert_eq!(
            args,
            [
                "-w", "-t", "filter", "-C", "INPUT", "-p", "tcp", "-s", "10.0.0.1", "--dport",
                "22", "-j", "DROP"
            ]
        );

        let backend = backend.with_wait_for_lock(false);
        let args = backend.build_args("-A", "filter", "INPUT", &rule);
        assert_eq!(&args[..4], ["-t", "filter", "-A", "INPUT"]);
    }

    #[tokio::test]
    async fn test_iptables_backend_against_mock() {
        let (backend, _state) = crate::core::test_helpers::mock_iptables_backend();
        let rule = spec("10.0.0.1");

        assert!(!backend.exists("filter", "INPUT", &rule).await.unwrap());
        backend.append("filter", "INPUT", &rule).await.unwrap();
        assert!(backend.exists("filter", "INPUT", &rule).await.unwrap());
        assert!(!backend.exists("filter", "FORWARD", &rule).await.unwrap());
        backend.delete("filter", "INPUT", &rule).await.unwrap();
        assert!(!backend.exists("filter", "INPUT", &rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_iptables_backend_delete_missing_reports_stderr() {
        let (backend, _state) = crate::core::test_helpers::mock_iptables_backend();
        let err = backend
            .delete("filter", "INPUT", &spec("10.0.0.1"))
            .await
            .unwrap_err();

        match err {
            Error::Backend {
                op,
                stderr,
                exit_code,
                ..
            } => {
                assert_eq!(op, "delete");
                assert_eq!(exit_code, Some(1));
                assert!(stderr.unwrap().contains("Bad rule"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_iptables_backend_missing_binary() {
        let backend = IptablesBackend::new("/nonexistent/tabserv-iptables").with_elevation(false);
        let err = backend
            .exists("filter", "INPUT", &spec("10.0.0.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { op: "exists", .. }));
        assert_eq!(err.status(), crate::core::error::StatusCode::Internal);
    }
}
