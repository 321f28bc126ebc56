//! The asynchronous delivery pipeline.
//!
//! Each node runs one [`Drain`] task over two unbounded queues. The inbox
//! holds mail pushed in by peer nodes, waiting to be merged into mailboxes;
//! the outbox holds locally sent mail bound for another node. Every tick the
//! drain merges the inbox, then attempts every due outbox entry: resolve the
//! target through the registry, push, and on any failure hold the entry for
//! a fixed-delay batch retry. An entry that fails its last attempt is
//! dropped and logged.
//!
//! The retry delay applies to each failed pass as a whole, not to entries
//! individually: one slow pass throttles the entire backlog.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, error};

use super::{peer, NodeState};
use crate::mail::MailRecord;
use crate::registry::RegistryClient;
use crate::timing;

/// A mail waiting for delivery to another node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    pub mail: MailRecord,
    /// Name of the node the mail is addressed to, resolved through the
    /// registry at each delivery attempt.
    pub target_node: String,
    /// Failed delivery attempts so far.
    pub retries: u32,
}

impl OutboxEntry {
    pub fn new(mail: MailRecord, target_node: impl Into<String>) -> Self {
        Self {
            mail,
            target_node: target_node.into(),
            retries: 0,
        }
    }

    /// Record a failed attempt. Returns `false` once the entry has used up
    /// all `max_retries` attempts and must be dropped.
    fn strike(&mut self, max_retries: u32) -> bool {
        self.retries += 1;
        self.retries < max_retries
    }
}

/// The node's delivery loop.
///
/// Single consumer of both queues; client sessions and peer handlers only
/// ever hold the sending ends. Mailbox appends happen here rather than in
/// the peer handler tasks, so inbound pushes never contend with client
/// sessions for the mailbox lock.
pub(crate) struct Drain {
    pub(crate) state: Arc<NodeState>,
    pub(crate) registry: RegistryClient,
    pub(crate) inbox: mpsc::UnboundedReceiver<MailRecord>,
    pub(crate) outbox: mpsc::UnboundedReceiver<OutboxEntry>,
    pub(crate) tick: Duration,
    pub(crate) retry_delay: Duration,
    pub(crate) max_retries: u32,
    pub(crate) push_timeout: Duration,
}

impl Drain {
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<()>) {
        let mut ticks = timing::interval(self.tick);
        let mut deferred: Vec<OutboxEntry> = Vec::new();
        let mut hold_until: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.drain_inbox();
                    self.drain_outbox(&mut deferred, &mut hold_until).await;
                }
                _ = stop.changed() => break,
            }
        }
    }

    /// Merge everything peers have pushed since the last tick.
    fn drain_inbox(&mut self) {
        let mut merged = 0usize;
        while let Ok(mail) = self.inbox.try_recv() {
            self.state.mailbox.append(mail);
            merged += 1;
        }

        if merged > 0 {
            debug!(node = %self.state.name, merged, "merged inbound mail");
        }
    }

    /// Attempt every queued entry, plus the deferred batch once its
    /// hold-down has expired. Failures go back into the deferred batch; the
    /// batch becomes due again `retry_delay` after this pass.
    async fn drain_outbox(
        &mut self,
        deferred: &mut Vec<OutboxEntry>,
        hold_until: &mut Option<Instant>,
    ) {
        let mut batch = Vec::new();
        if hold_until.map_or(true, |due| Instant::now() >= due) {
            batch.append(deferred);
            *hold_until = None;
        }
        while let Ok(entry) = self.outbox.try_recv() {
            batch.push(entry);
        }
        if batch.is_empty() {
            return;
        }

        let mut held = Vec::new();
        for mut entry in batch {
            if self.attempt(&entry).await {
                continue;
            }

            if entry.strike(self.max_retries) {
                held.push(entry);
            } else {
                error!(
                    node = %self.state.name,
                    id = %entry.mail.id,
                    target = %entry.target_node,
                    attempts = entry.retries,
                    "dropping undeliverable mail"
                );
            }
        }

        if !held.is_empty() {
            debug!(
                node = %self.state.name,
                held = held.len(),
                delay = ?self.retry_delay,
                "holding failed deliveries for retry"
            );
            deferred.append(&mut held);
            *hold_until = Some(Instant::now() + self.retry_delay);
        }
    }

    /// One delivery attempt: resolve the target node, push the mail, and
    /// require the peer's acknowledgement.
    async fn attempt(&self, entry: &OutboxEntry) -> bool {
        let record = match self.registry.resolve(&entry.target_node).await {
            Ok(record) => record,
            Err(err) => {
                debug!(
                    node = %self.state.name,
                    id = %entry.mail.id,
                    target = %entry.target_node,
                    %err,
                    "target node did not resolve"
                );
                return false;
            }
        };

        match peer::push_mail(&record.ip, record.port, &entry.mail, self.push_timeout).await {
            Ok(()) => {
                debug!(
                    node = %self.state.name,
                    id = %entry.mail.id,
                    target = %entry.target_node,
                    "delivered mail to peer node"
                );
                true
            }
            Err(err) => {
                debug!(
                    node = %self.state.name,
                    id = %entry.mail.id,
                    target = %entry.target_node,
                    %err,
                    "mail push failed"
                );
                false
            }
        }
    }
}
