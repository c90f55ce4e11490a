//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::backend::{FirewallBackend, IptablesBackend, MemoryBackend};
use crate::core::error::{Error, Result};
use crate::core::history::{HistoryRecord, HistoryStore, MemoryHistory};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Mutex for tests that need exclusive access to environment variables.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Builds an [`IptablesBackend`] that runs `tests/mock_iptables.sh` with its
/// own state file.
///
/// The script is symlinked into a fresh directory and keeps its rules next to
/// the link. Keep the returned directory alive for the duration of the test.
pub fn mock_iptables_backend() -> (IptablesBackend, tempfile::TempDir) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let mock = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("mock_iptables.sh");
    std::fs::set_permissions(&mock, std::fs::Permissions::from_mode(0o755))
        .expect("chmod mock script");

    let link = dir.path().join("iptables");
    std::os::unix::fs::symlink(&mock, &link).expect("symlink mock script");

    let backend = IptablesBackend::new(link.to_string_lossy().into_owned()).with_elevation(false);
    (backend, dir)
}

/// Backend that delegates to a [`MemoryBackend`] but fails selected operations.
#[derive(Debug, Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    pub fail_exists: AtomicBool,
    pub fail_append: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl FlakyBackend {
    fn check(flag: &AtomicBool, op: &'static str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Backend {
                op,
                message: "injected failure".to_string(),
                stderr: Some("iptables: injected failure".to_string()),
                exit_code: Some(4),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FirewallBackend for FlakyBackend {
    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        Self::check(&self.fail_exists, "exists")?;
        self.inner.exists(table, chain, spec).await
    }

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        Self::check(&self.fail_append, "append")?;
        self.inner.append(table, chain, spec).await
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(table, chain, spec).await
    }
}

/// History store whose writes or reads can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyHistory {
    pub inner: MemoryHistory,
    pub fail_put: AtomicBool,
    pub fail_all: AtomicBool,
}

#[async_trait]
impl HistoryStore for FlakyHistory {
    async fn put(&self, key: &str, record: HistoryRecord) -> Result<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(Error::History("injected write failure".to_string()));
        }
        self.inner.put(key, record).await
    }

    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn all(&self) -> Result<BTreeMap<String, HistoryRecord>> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("injected read failure")));
        }
        self.inner.all().await
    }
}
