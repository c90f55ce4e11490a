//! Rule engine
//!
//! Every mutation first asks the backend whether an equivalent rule is
//! installed, so add and delete are decided by what the packet filter really
//! holds rather than by what the history remembers.
//!
//! # Consistency
//!
//! - A failed backend append leaves no history entry.
//! - A failed history write after a successful append leaves the rule
//!   installed and reports an error. Nothing is rolled back.
//! - Deletes never remove history entries; [`RuleEngine::list`] reconciles
//!   history against the backend instead.

use crate::core::backend::FirewallBackend;
use crate::core::error::{Error, Result};
use crate::core::events::{ChangeEvent, ChangeKind, EventHub};
use crate::core::history::{HistoryRecord, HistoryStore};
use crate::core::locks::KeyLocks;
use crate::core::rule::{self, DEFAULT_CHAIN, DEFAULT_TABLE, RuleIntent, RuleSpec};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Outcome of a successful add or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChange {
    pub applied: bool,
    pub key: String,
    pub formatted_rule: String,
}

pub struct RuleEngine {
    backend: Arc<dyn FirewallBackend>,
    history: Arc<dyn HistoryStore>,
    hub: EventHub,
    table: String,
    chain: String,
    locks: KeyLocks,
}

impl RuleEngine {
    pub fn new(
        backend: Arc<dyn FirewallBackend>,
        history: Arc<dyn HistoryStore>,
        hub: EventHub,
    ) -> Self {
        Self {
            backend,
            history,
            hub,
            table: DEFAULT_TABLE.to_string(),
            chain: DEFAULT_CHAIN.to_string(),
            locks: KeyLocks::new(),
        }
    }

    /// Targets a different `(table, chain)` than `filter`/`INPUT`.
    pub fn with_target(mut self, table: impl Into<String>, chain: impl Into<String>) -> Self {
        self.table = table.into();
        self.chain = chain.into();
        self
    }

    /// Installs `intent` unless the backend already has it.
    pub async fn add(&self, intent: &RuleIntent) -> Result<RuleChange> {
        let spec = intent.spec();
        let key = spec.key();
        let _guard = self.locks.lock(&key).await;

        if self
            .backend
            .exists(&self.table, &self.chain, spec.tokens())
            .await?
        {
            debug!("add rejected, rule already present: {key}");
            return Err(Error::AlreadyExists(key));
        }

        self.backend
            .append(&self.table, &self.chain, spec.tokens())
            .await?;

        if let Err(e) = self.history.put(&key, HistoryRecord::now(&key)).await {
            error!("rule installed but history write failed for '{key}': {e}");
            return Err(into_history_error(e));
        }

        let delivered = self
            .hub
            .publish(&ChangeEvent::new(intent.protocol().topic(), ChangeKind::Add, &key));
        info!("added rule '{key}' (notified {delivered} subscribers)");

        Ok(RuleChange {
            applied: true,
            formatted_rule: spec.format_append(&self.chain),
            key,
        })
    }

    /// Removes `intent` if the backend has it. The history entry is kept.
    pub async fn delete(&self, intent: &RuleIntent) -> Result<RuleChange> {
        let spec = intent.spec();
        let key = spec.key();
        let _guard = self.locks.lock(&key).await;

        if !self
            .backend
            .exists(&self.table, &self.chain, spec.tokens())
            .await?
        {
            debug!("delete rejected, rule not present: {key}");
            return Err(Error::NotFound(key));
        }

        self.backend
            .delete(&self.table, &self.chain, spec.tokens())
            .await?;

        let delivered = self.hub.publish(&ChangeEvent::new(
            intent.protocol().topic(),
            ChangeKind::Delete,
            &key,
        ));
        info!("deleted rule '{key}' (notified {delivered} subscribers)");

        Ok(RuleChange {
            applied: true,
            formatted_rule: spec.format_delete(&self.chain),
            key,
        })
    }

    /// Rules from history that the backend confirms are still installed.
    ///
    /// A single failed existence check fails the whole listing.
    pub async fn list(&self) -> Result<Vec<String>> {
        let entries = self.history.all().await.map_err(into_history_error)?;
        let mut rules = Vec::with_capacity(entries.len());

        for key in entries.keys() {
            let Some(spec) = RuleSpec::from_key(key) else {
                continue;
            };
            if self
                .backend
                .exists(&self.table, &self.chain, spec.tokens())
                .await?
            {
                rules.push(rule::format_listing(&self.chain, key));
            } else {
                debug!("history entry no longer installed: {key}");
            }
        }

        Ok(rules)
    }

    /// Every key ever recorded, without backend cross-check.
    pub async fn history(&self) -> Result<Vec<String>> {
        Ok(self
            .history
            .all()
            .await
            .map_err(into_history_error)?
            .into_keys()
            .collect())
    }
}

fn into_history_error(e: Error) -> Error {
    match e {
        Error::History(_) => e,
        other => Error::History(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::MemoryBackend;
    use crate::core::history::MemoryHistory;
    use crate::core::test_helpers::{FlakyBackend, FlakyHistory};
    use std::sync::atomic::Ordering;

    fn engine() -> (RuleEngine, Arc<MemoryBackend>, EventHub) {
        let backend = Arc::new(MemoryBackend::new());
        let hub = EventHub::new();
        let engine = RuleEngine::new(
            backend.clone(),
            Arc::new(MemoryHistory::new()),
            hub.clone(),
        );
        (engine, backend, hub)
    }

    fn intent(src: &str, port: u16) -> RuleIntent {
        RuleIntent::drop_tcp(src, port).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_add_again() {
        let (engine, backend, _hub) = engine();
        let rule = intent("192.168.1.100", 22);

        let change = engine.add(&rule).await.unwrap();
        assert!(change.applied);
        assert_eq!(
            change.formatted_rule,
            "-A INPUT [-p tcp -s 192.168.1.100 --dport 22 -j DROP]"
        );
        assert_eq!(backend.rule_count(), 1);

        let err = engine.add(&rule).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(backend.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let (engine, _backend, _hub) = engine();
        let err = engine.delete(&intent("10.0.0.1", 80)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_keeps_history() {
        let (engine, _backend, _hub) = engine();
        let rule = intent("10.0.0.1", 8080);

        engine.add(&rule).await.unwrap();
        let change = engine.delete(&rule).await.unwrap();
        assert_eq!(
            change.formatted_rule,
            "-D INPUT [-p tcp -s 10.0.0.1 --dport 8080 -j DROP]"
        );

        assert!(engine.list().await.unwrap().is_empty());
        assert_eq!(engine.history().await.unwrap(), vec![rule.canonical_key()]);
    }

    #[tokio::test]
    async fn test_list_reconciles_out_of_band_delete() {
        let (engine, backend, _hub) = engine();
        let kept = intent("10.0.0.1", 8080);
        let removed = intent("127.0.0.1", 8080);
        engine.add(&kept).await.unwrap();
        engine.add(&removed).await.unwrap();

        backend
            .delete("filter", "INPUT", removed.spec().tokens())
            .await
            .unwrap();

        assert_eq!(
            engine.list().await.unwrap(),
            vec![format!("-A INPUT {}", kept.canonical_key())]
        );
        assert_eq!(engine.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_events_published_on_change() {
        let (engine, _backend, hub) = engine();
        let mut sub = hub.subscribe("tcp");
        let rule = intent("10.0.0.1", 8080);

        engine.add(&rule).await.unwrap();
        let _ = engine.add(&rule).await;
        engine.delete(&rule).await.unwrap();

        let first = sub.try_recv().unwrap();
        assert_eq!(first.kind, ChangeKind::Add);
        assert_eq!(first.rule_key, rule.canonical_key());
        let second = sub.try_recv().unwrap();
        assert_eq!(second.kind, ChangeKind::Delete);
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_custom_target() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = RuleEngine::new(
            backend.clone(),
            Arc::new(MemoryHistory::new()),
            EventHub::new(),
        )
        .with_target("filter", "FORWARD");

        let change = engine.add(&intent("10.0.0.1", 22)).await.unwrap();
        assert!(change.formatted_rule.starts_with("-A FORWARD ["));
        assert_eq!(backend.rules("filter", "FORWARD").len(), 1);
        assert!(backend.rules("filter", "INPUT").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_for_same_key() {
        let (engine, backend, _hub) = engine();
        let engine = Arc::new(engine);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.add(&intent("10.9.9.9", 443)).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert!(matches!(e, Error::AlreadyExists(_))),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(backend.rule_count(), 1);
    }

    #[tokio::test]
    async fn test_append_failure_writes_no_history() {
        let backend = Arc::new(FlakyBackend::default());
        backend.fail_append.store(true, Ordering::SeqCst);
        let history = Arc::new(MemoryHistory::new());
        let hub = EventHub::new();
        let mut sub = hub.subscribe("tcp");
        let engine = RuleEngine::new(backend.clone(), history.clone(), hub);

        let err = engine.add(&intent("10.0.0.1", 22)).await.unwrap_err();
        assert!(matches!(err, Error::Backend { op: "append", .. }));
        assert!(history.is_empty());
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_history_failure_leaves_rule_installed() {
        let backend = Arc::new(MemoryBackend::new());
        let history = Arc::new(FlakyHistory::default());
        history.fail_put.store(true, Ordering::SeqCst);
        let hub = EventHub::new();
        let mut sub = hub.subscribe("tcp");
        let engine = RuleEngine::new(backend.clone(), history, hub);

        let err = engine.add(&intent("10.0.0.1", 22)).await.unwrap_err();
        assert!(matches!(err, Error::History(_)));
        assert_eq!(err.status(), crate::core::error::StatusCode::Internal);
        assert_eq!(backend.rule_count(), 1);
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_exists_failure_aborts_listing() {
        let backend = Arc::new(FlakyBackend::default());
        let engine = RuleEngine::new(
            backend.clone(),
            Arc::new(MemoryHistory::new()),
            EventHub::new(),
        );
        engine.add(&intent("10.0.0.1", 22)).await.unwrap();
        engine.add(&intent("10.0.0.2", 22)).await.unwrap();

        backend.fail_exists.store(true, Ordering::SeqCst);
        assert!(matches!(
            engine.list().await.unwrap_err(),
            Error::Backend { op: "exists", .. }
        ));
        // History replay does not consult the backend
        assert_eq!(engine.history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_history_read_failure() {
        let history = Arc::new(FlakyHistory::default());
        history.fail_all.store(true, Ordering::SeqCst);
        let engine = RuleEngine::new(Arc::new(MemoryBackend::new()), history, EventHub::new());

        assert!(matches!(engine.list().await.unwrap_err(), Error::History(_)));
        match engine.history().await.unwrap_err() {
            Error::History(msg) => assert!(msg.contains("injected read failure"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_failure_publishes_nothing() {
        let backend = Arc::new(FlakyBackend::default());
        let hub = EventHub::new();
        let engine = RuleEngine::new(backend.clone(), Arc::new(MemoryHistory::new()), hub.clone());
        let rule = intent("10.0.0.1", 22);
        engine.add(&rule).await.unwrap();

        let mut sub = hub.subscribe("tcp");
        backend.fail_delete.store(true, Ordering::SeqCst);
        assert!(engine.delete(&rule).await.is_err());
        assert_eq!(sub.try_recv(), None);
        assert_eq!(backend.inner.rule_count(), 1);
    }
}
