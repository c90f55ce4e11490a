//! Line-oriented front end over [`RuleService`]
//!
//! `tabserv shell` reads one command per line and `tabserv demo` replays a
//! fixed client session. Both write their output as lines into an `mpsc`
//! channel so the caller decides where text ends up (stdout in the binary,
//! a `Vec` in tests).

use crate::core::error::{Error, Result};
use crate::core::events::{ChangeEvent, EventHub};
use crate::service::RuleService;
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const HELP: &str = "\
commands:
  add <source> <port>       install a TCP drop rule
  delete <source> <port>    remove a TCP drop rule
  list                      rules from history that are still installed
  history                   every rule ever added
  watch <topic>             print change events for topic (e.g. tcp)
  unwatch [topic]           stop one or all watchers
  help                      show this text
  quit                      exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Add { source: String, port: u16 },
    Delete { source: String, port: u16 },
    List,
    History,
    Watch(String),
    Unwatch(Option<String>),
    Help,
    Quit,
}

impl ShellCommand {
    /// Parses one input line. `Ok(None)` for blank lines and `#` comments.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        if verb.starts_with('#') {
            return Ok(None);
        }
        let args: Vec<&str> = words.collect();

        let command = match (verb, args.as_slice()) {
            ("add", [source, port]) => Self::Add {
                source: (*source).to_string(),
                port: parse_port(port)?,
            },
            ("delete" | "del", [source, port]) => Self::Delete {
                source: (*source).to_string(),
                port: parse_port(port)?,
            },
            ("list" | "ls", []) => Self::List,
            ("history", []) => Self::History,
            ("watch", [topic]) => Self::Watch((*topic).to_string()),
            ("unwatch", []) => Self::Unwatch(None),
            ("unwatch", [topic]) => Self::Unwatch(Some((*topic).to_string())),
            ("help" | "?", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            ("add" | "delete" | "del", _) => {
                return Err(format!("usage: {verb} <source> <port>"));
            }
            ("watch", _) => return Err("usage: watch <topic>".to_string()),
            _ => return Err(format!("unknown command '{verb}' (try 'help')")),
        };
        Ok(Some(command))
    }
}

fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    raw.parse::<u16>()
        .map_err(|_| format!("invalid port '{raw}' (expected 1-65535)"))
}

async fn emit(out: &mpsc::Sender<String>, line: impl Into<String>) -> Result<()> {
    out.send(line.into())
        .await
        .map_err(|_| Error::Unavailable("output closed".to_string()))
}

fn describe_error(e: &Error) -> String {
    format!("error: {}: {e}", e.status())
}

fn describe_event(event: &ChangeEvent) -> String {
    format!("[{}] event type: {}, rule: {}", event.topic, event.kind, event.rule_key)
}

struct Watcher {
    hub: EventHub,
    topic: String,
    subscriber: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Watcher {
    /// Subscribes on `topic` and relays events as text until cancelled.
    fn start(service: &RuleService, topic: &str, out: mpsc::Sender<String>) -> Result<Self> {
        let subscription = service.subscribe(topic)?;
        let subscriber = subscription.id();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(service.hub().capacity());

        let forward = {
            let service = service.clone();
            let cancel = cancel.clone();
            async move {
                let result = service.forward_events(subscription, &tx, &cancel).await;
                drop(tx);
                result
            }
        };
        let relay = async move {
            while let Some(event) = rx.recv().await {
                if out.send(describe_event(&event)).await.is_err() {
                    break;
                }
            }
        };

        let task = tokio::spawn({
            let topic = topic.to_string();
            async move {
                let (result, ()) = tokio::join!(forward, relay);
                match result {
                    Ok(count) => debug!("watcher on '{topic}' stopped after {count} events"),
                    Err(e) => warn!("watcher on '{topic}' ended: {e}"),
                }
            }
        });

        Ok(Self {
            hub: service.hub().clone(),
            topic: topic.to_string(),
            subscriber,
            cancel,
            task,
        })
    }

    /// Stops right away. Events still queued are discarded.
    async fn stop(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Closes the subscription and waits until every event already queued
    /// for it has been relayed.
    async fn finish(self) {
        self.hub.unsubscribe(&self.topic, self.subscriber);
        self.join().await;
    }

    async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("watcher task failed: {e}");
        }
    }
}

async fn print_list(service: &RuleService, out: &mpsc::Sender<String>) -> Result<()> {
    match service.list_active_rules().await {
        Ok(rules) if rules.is_empty() => emit(out, "(no active rules)").await,
        Ok(rules) => {
            for (i, rule) in rules.iter().enumerate() {
                emit(out, format!("rule[{i}] :: {rule}")).await?;
            }
            Ok(())
        }
        Err(e) => emit(out, describe_error(&e)).await,
    }
}

async fn print_history(service: &RuleService, out: &mpsc::Sender<String>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<String>>(16);
    let producer = async move {
        let result = service.stream_history(&tx).await;
        drop(tx);
        result
    };
    let consumer = async {
        let mut lines = Vec::new();
        while let Some(batch) = rx.recv().await {
            lines.extend(batch);
        }
        lines
    };

    let (result, lines) = tokio::join!(producer, consumer);
    for line in &lines {
        emit(out, format!("entry :: {line}")).await?;
    }
    match result {
        Ok(_) => emit(out, "history :: completed").await,
        Err(e) => emit(out, describe_error(&e)).await,
    }
}

async fn add(
    service: &RuleService,
    out: &mpsc::Sender<String>,
    source: &str,
    port: u16,
) -> Result<()> {
    match service.add_drop_rule(source, port).await {
        Ok(resp) => {
            emit(
                out,
                format!("added={} rule={}", resp.added, resp.formatted_rule),
            )
            .await
        }
        Err(e) => emit(out, describe_error(&e)).await,
    }
}

async fn delete(
    service: &RuleService,
    out: &mpsc::Sender<String>,
    source: &str,
    port: u16,
) -> Result<()> {
    match service.delete_drop_rule(source, port).await {
        Ok(resp) => {
            emit(
                out,
                format!("deleted={} rule={}", resp.deleted, resp.formatted_rule),
            )
            .await
        }
        Err(e) => emit(out, describe_error(&e)).await,
    }
}

/// Runs commands from `input` until `quit`, end of input, or `shutdown`.
///
/// Request failures are printed and do not end the session. Only a closed
/// output channel or an unreadable input does.
pub async fn run_shell<R>(
    service: &RuleService,
    input: R,
    out: &mpsc::Sender<String>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut watchers: HashMap<String, Watcher> = HashMap::new();

    let result = loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(Error::Io(e)),
        };

        let command = match ShellCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                if let Err(e) = emit(out, msg).await {
                    break Err(e);
                }
                continue;
            }
        };

        let step = match command {
            ShellCommand::Add { source, port } => add(service, out, &source, port).await,
            ShellCommand::Delete { source, port } => delete(service, out, &source, port).await,
            ShellCommand::List => print_list(service, out).await,
            ShellCommand::History => print_history(service, out).await,
            ShellCommand::Watch(topic) => {
                if watchers.contains_key(&topic) {
                    emit(out, format!("already watching '{topic}'")).await
                } else {
                    match Watcher::start(service, &topic, out.clone()) {
                        Ok(watcher) => {
                            watchers.insert(topic.clone(), watcher);
                            emit(out, format!("watching '{topic}'")).await
                        }
                        Err(e) => emit(out, describe_error(&e)).await,
                    }
                }
            }
            ShellCommand::Unwatch(Some(topic)) => match watchers.remove(&topic) {
                Some(watcher) => {
                    watcher.stop().await;
                    emit(out, format!("stopped watching '{topic}'")).await
                }
                None => emit(out, format!("not watching '{topic}'")).await,
            },
            ShellCommand::Unwatch(None) => {
                let count = watchers.len();
                for (_, watcher) in watchers.drain() {
                    watcher.stop().await;
                }
                emit(out, format!("stopped {count} watchers")).await
            }
            ShellCommand::Help => emit(out, HELP).await,
            ShellCommand::Quit => break Ok(()),
        };

        if let Err(e) = step {
            break Err(e);
        }
    };

    for (_, watcher) in watchers.drain() {
        watcher.stop().await;
    }
    result
}

/// Replays a fixed client session: a `tcp` watcher, then a series of adds,
/// deletes, a listing and a history dump.
pub async fn run_demo(service: &RuleService, out: &mpsc::Sender<String>) -> Result<()> {
    let watcher = Watcher::start(service, "tcp", out.clone())?;

    add(service, out, "192.168.1.100", 22).await?;
    delete(service, out, "192.168.1.100", 22).await?;
    add(service, out, "10.0.0.1", 8080).await?;
    add(service, out, "127.0.0.1", 8080).await?;
    print_list(service, out).await?;
    delete(service, out, "10.0.0.1", 8080).await?;
    print_history(service, out).await?;

    watcher.finish().await;
    Ok(())
}
