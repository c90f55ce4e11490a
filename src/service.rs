//! Service facade
//!
//! [`RuleService`] is what a transport (or the CLI shell) talks to. It turns
//! raw caller input into [`RuleIntent`]s, runs them through the
//! [`RuleEngine`], and exposes history and change feeds as streams pushed into
//! caller-provided `mpsc` sinks. Every failure is an [`Error`] whose
//! [`status`](Error::status) is the externally visible code.

use crate::audit::{AuditLog, EventType};
use crate::config::{AppConfig, BackendKind};
use crate::core::backend::{FirewallBackend, IptablesBackend, MemoryBackend};
use crate::core::engine::{RuleChange, RuleEngine};
use crate::core::error::{Error, Result};
use crate::core::events::{ChangeEvent, EventHub, Subscription};
use crate::core::history::{HistoryStore, MemoryHistory};
use crate::core::rule::RuleIntent;
use crate::validators;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddResponse {
    pub added: bool,
    pub formatted_rule: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub formatted_rule: String,
}

#[derive(Clone)]
pub struct RuleService {
    engine: Arc<RuleEngine>,
    hub: EventHub,
    history_batch_size: usize,
    audit: Option<AuditLog>,
}

impl RuleService {
    pub fn new(engine: Arc<RuleEngine>, hub: EventHub) -> Self {
        Self {
            engine,
            hub,
            history_batch_size: 1,
            audit: None,
        }
    }

    /// Number of history lines per streamed message (at least 1).
    pub fn with_history_batch_size(mut self, size: usize) -> Self {
        self.history_batch_size = size.max(1);
        self
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Wires backend, history store, hub and engine from `config`.
    ///
    /// `dry_run` forces the in-memory backend regardless of the configured one.
    pub fn from_config(config: &AppConfig, dry_run: bool) -> Self {
        let backend: Arc<dyn FirewallBackend> = if dry_run || config.backend == BackendKind::Memory
        {
            info!("Using in-memory firewall backend");
            Arc::new(MemoryBackend::new())
        } else {
            info!("Using iptables backend at {}", config.iptables_path);
            Arc::new(
                IptablesBackend::new(config.iptables_path.clone())
                    .with_elevation(config.elevate)
                    .with_wait_for_lock(config.wait_for_lock)
                    .with_timeout(Duration::from_secs(config.backend_timeout_secs)),
            )
        };
        let history: Arc<dyn HistoryStore> = Arc::new(MemoryHistory::new());
        let hub = EventHub::with_capacity(config.subscriber_queue_capacity);
        let engine = RuleEngine::new(backend, history, hub.clone())
            .with_target(config.table.clone(), config.chain.clone());

        let mut service =
            Self::new(Arc::new(engine), hub).with_history_batch_size(config.history_batch_size);

        if config.audit_log {
            match AuditLog::new() {
                Ok(audit) => service = service.with_audit_log(audit),
                Err(e) => warn!("Audit log disabled: {e}"),
            }
        }
        service
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    fn intent(source: &str, port: u16) -> Result<RuleIntent> {
        let intent = RuleIntent::drop_tcp(source, port)?;
        if let Ok(network) = validators::validate_source_address(intent.source())
            && let Some(note) = validators::check_reserved_ip(network)
        {
            debug!("{}: {note}", intent.source());
        }
        Ok(intent)
    }

    async fn record(&self, event_type: EventType, key: &str, result: &Result<RuleChange>) {
        if let Some(audit) = &self.audit {
            let error = result.as_ref().err().map(ToString::to_string);
            audit
                .log_rule_change(event_type, key, result.is_ok(), error)
                .await;
        }
    }

    /// Installs a TCP drop rule for `source` -> local `port`.
    pub async fn add_drop_rule(&self, source: &str, port: u16) -> Result<AddResponse> {
        let intent = Self::intent(source, port)?;
        let result = self.engine.add(&intent).await;
        self.record(EventType::AddRule, &intent.canonical_key(), &result)
            .await;

        let change = result?;
        Ok(AddResponse {
            added: change.applied,
            formatted_rule: change.formatted_rule,
        })
    }

    pub async fn delete_drop_rule(&self, source: &str, port: u16) -> Result<DeleteResponse> {
        let intent = Self::intent(source, port)?;
        let result = self.engine.delete(&intent).await;
        self.record(EventType::DeleteRule, &intent.canonical_key(), &result)
            .await;

        let change = result?;
        Ok(DeleteResponse {
            deleted: change.applied,
            formatted_rule: change.formatted_rule,
        })
    }

    pub async fn list_active_rules(&self) -> Result<Vec<String>> {
        self.engine.list().await
    }

    /// Pushes every history key into `sink`, `history_batch_size` lines per
    /// message. Returns the number of lines sent.
    ///
    /// A closed sink aborts the stream with [`Error::Unavailable`].
    pub async fn stream_history(&self, sink: &mpsc::Sender<Vec<String>>) -> Result<usize> {
        let lines = self.engine.history().await?;

        for batch in lines.chunks(self.history_batch_size) {
            sink.send(batch.to_vec())
                .await
                .map_err(|_| Error::Unavailable("history stream closed by receiver".to_string()))?;
        }
        debug!("streamed {} history lines", lines.len());
        Ok(lines.len())
    }

    /// Registers a change-feed subscriber on `topic`.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let topic = validators::validate_topic(topic)
            .map_err(|msg| Error::validation("topic", msg))?;
        Ok(self.hub.subscribe(&topic))
    }

    /// Copies events from `subscription` into `sink` until `cancel` fires or
    /// the hub closes the queue. Returns the number of events forwarded.
    ///
    /// The subscription is consumed and unregistered on return.
    pub async fn forward_events(
        &self,
        mut subscription: Subscription,
        sink: &mpsc::Sender<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut forwarded = 0;

        while let Some(event) = subscription.recv_until(cancel).await {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                sent = sink.send(event) => {
                    sent.map_err(|_| {
                        Error::Unavailable(format!(
                            "event stream for '{}' closed by receiver",
                            subscription.topic()
                        ))
                    })?;
                }
            }
            forwarded += 1;
        }

        debug!(
            "subscriber {} on '{}' finished after {forwarded} events",
            subscription.id(),
            subscription.topic()
        );
        Ok(forwarded)
    }

    /// Ends every subscriber stream.
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}
