//! Command/response correlation.
//!
//! Flow:
//! 1. `register()` creates a pending command and hands back a [`CommandHandle`]
//! 2. The broker forwards the command (carrying the key as `id`) to hardware
//! 3. A response resolves by `id` when it has one, otherwise the oldest
//!    pending command (FIFO)
//! 4. A deadline task calls `expire()`; the handle fails with `CommandTimeout`
//!
//! An expired command leaves a debt: its reply may still arrive. An id-less
//! reply pays a debt instead of resolving the oldest pending command only
//! when that command was already in flight when the debt arose. A command
//! issued after the timeout was reported starts with a clean slate, and
//! debts lapse one command timeout after they were recorded.

use crate::registry::ConnectionId;
use lunar_bridge_core::{Envelope, unix_millis};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a command.
pub type CommandResult = Result<Envelope, CommandError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("no hardware peer connected")]
    NoHardwarePeer,
    #[error("command {key} timed out after {after:?}")]
    CommandTimeout { key: String, after: Duration },
    #[error("hardware connection lost")]
    ConnectionLost,
    #[error("a command with id {0} is already pending")]
    DuplicateKey(String),
}

/// Future resolving to a command's outcome.
#[derive(Debug)]
pub struct CommandHandle {
    key: Option<String>,
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandHandle {
    /// A handle that is already resolved with an error.
    pub fn failed(error: CommandError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { key: None, rx }
    }

    /// Correlation key, if a pending command was created.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

impl Future for CommandHandle {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CommandError::ConnectionLost)))
    }
}

struct PendingCommand {
    key: String,
    command: String,
    origin: Option<ConnectionId>,
    issued_at: Instant,
    reply: oneshot::Sender<CommandResult>,
}

impl PendingCommand {
    fn finish(self, result: CommandResult) -> Finished {
        let error = result.as_ref().err().cloned();
        // receiver may be gone; the caller stopped waiting
        let _ = self.reply.send(result);
        Finished {
            key: self.key,
            command: self.command,
            origin: self.origin,
            error,
        }
    }
}

/// A reply still owed by an expired command.
struct Debt {
    key: String,
    expired_at: Instant,
}

/// A pending command that just left the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finished {
    pub key: String,
    pub command: String,
    pub origin: Option<ConnectionId>,
    /// Set when the command failed.
    pub error: Option<CommandError>,
}

/// A newly registered command.
#[derive(Debug)]
pub struct Registered {
    pub key: String,
    pub deadline: Instant,
    pub handle: CommandHandle,
}

pub struct Correlator {
    /// Issuance order.
    pending: VecDeque<PendingCommand>,
    default_timeout: Duration,
    /// Oldest first.
    owed: VecDeque<Debt>,
    seq: u64,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            default_timeout,
            owed: VecDeque::new(),
            seq: 0,
        }
    }

    /// Create a pending command for `command`.
    ///
    /// The envelope's own `id` becomes the key when present; otherwise one is
    /// derived from the command text and issue time.
    pub fn register(
        &mut self,
        command: &Envelope,
        origin: Option<ConnectionId>,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<Registered, CommandError> {
        let name = command.command.clone().unwrap_or_default();
        let key = match &command.id {
            Some(id) => {
                if self.pending.iter().any(|p| &p.key == id) {
                    return Err(CommandError::DuplicateKey(id.clone()));
                }
                id.clone()
            }
            None => self.derive_key(&name),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingCommand {
            key: key.clone(),
            command: name,
            origin,
            issued_at: now,
            reply: tx,
        });
        debug!("Registered command {} ({} pending)", key, self.pending.len());

        Ok(Registered {
            key: key.clone(),
            deadline: now + timeout.unwrap_or(self.default_timeout),
            handle: CommandHandle { key: Some(key), rx },
        })
    }

    fn derive_key(&mut self, name: &str) -> String {
        loop {
            self.seq += 1;
            let key = format!("{name}:{}:{}", unix_millis(), self.seq);
            if !self.pending.iter().any(|p| p.key == key) {
                return key;
            }
        }
    }

    /// Resolve the command a response belongs to.
    pub fn resolve(&mut self, response: &Envelope, now: Instant) -> Option<Finished> {
        let lapse = self.default_timeout;
        self.owed
            .retain(|debt| now.saturating_duration_since(debt.expired_at) <= lapse);

        let index = match &response.id {
            Some(id) => {
                let index = self.pending.iter().position(|p| &p.key == id);
                if index.is_none() {
                    match self.owed.iter().position(|debt| &debt.key == id) {
                        Some(at) => {
                            self.owed.remove(at);
                            debug!("Late response for expired command {}", id);
                        }
                        None => warn!("Response for unknown command {}", id),
                    }
                }
                index?
            }
            None => {
                let Some(oldest) = self.pending.front() else {
                    if self.owed.pop_front().is_some() {
                        debug!("Late response absorbed ({} still owed)", self.owed.len());
                    } else {
                        debug!("Response with nothing pending");
                    }
                    return None;
                };
                // only a command in flight when a debt arose can be behind it
                let issued_at = oldest.issued_at;
                match self.owed.iter().position(|debt| issued_at < debt.expired_at) {
                    Some(at) => {
                        self.owed.remove(at);
                        debug!("Late response absorbed ({} still owed)", self.owed.len());
                        return None;
                    }
                    None => {
                        self.owed.clear();
                        0
                    }
                }
            }
        };

        let pending = self.pending.remove(index)?;
        debug!(
            "Resolved command {} after {}ms",
            pending.key,
            now.saturating_duration_since(pending.issued_at).as_millis()
        );
        Some(pending.finish(Ok(response.clone())))
    }

    /// Fail a command whose deadline passed. No-op if it already resolved.
    pub fn expire(&mut self, key: &str, now: Instant) -> Option<Finished> {
        let index = self.pending.iter().position(|p| p.key == key)?;
        let pending = self.pending.remove(index)?;
        let after = now.saturating_duration_since(pending.issued_at);
        warn!("Command {} timed out after {}ms", key, after.as_millis());
        self.owed.push_back(Debt {
            key: key.to_string(),
            expired_at: now,
        });
        Some(pending.finish(Err(CommandError::CommandTimeout {
            key: key.to_string(),
            after,
        })))
    }

    /// Fail everything still pending. Debts are forgiven; nothing owed by
    /// a lost peer will arrive.
    pub fn fail_all(&mut self, error: CommandError) -> Vec<Finished> {
        self.owed.clear();
        self.pending
            .drain(..)
            .map(|pending| pending.finish(Err(error.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.iter().any(|p| p.key == key)
    }

    /// Replies still expected from expired commands.
    pub fn owed(&self) -> usize {
        self.owed.len()
    }
}
