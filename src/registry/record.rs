use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Health of a registered node, as judged by the registry's prober.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Ok,
    Fail,
}

impl NodeStatus {
    /// Whether a node with this status should be offered to clients.
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, NodeStatus::Ok)
    }
}

/// A registered mail node, keyed by name in the [`RegistryStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Address the node asked to be reached at. Stored as given; the
    /// registry never validates it.
    pub ip: String,
    pub port: u16,
    pub status: NodeStatus,
    /// When the node last registered.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    /// When the prober last finished a probe of this node, successful or not.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_ping: Option<OffsetDateTime>,
    /// Consecutive failed probes.
    pub strikes: u32,
}

/// The registry's node table.
///
/// A single lock guards the table; registrations, queries, and probe results
/// are each one short critical section. Probes themselves happen outside the
/// lock, so every registration carries an epoch: a probe result is discarded
/// if the node re-registered (or disappeared) while the probe was in flight.
#[derive(Debug)]
pub struct RegistryStore {
    max_strikes: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<String, Registration>,
    epochs: u64,
}

#[derive(Debug)]
struct Registration {
    record: NodeRecord,
    epoch: u64,
}

/// A snapshot of one node for the prober.
#[derive(Clone, Debug)]
pub(crate) struct ProbeTarget {
    pub(crate) name: String,
    pub(crate) ip: String,
    pub(crate) port: u16,
    pub(crate) epoch: u64,
}

/// What applying a probe result did to a node's record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ProbeOutcome {
    pub(crate) previous: NodeStatus,
    pub(crate) status: NodeStatus,
    pub(crate) strikes: u32,
    pub(crate) evicted: bool,
}

impl RegistryStore {
    /// Create an empty store. `max_strikes` failed probes evict a node;
    /// `0` disables eviction.
    pub fn new(max_strikes: u32) -> Self {
        Self {
            max_strikes,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Insert or overwrite the record for `name`, resetting its status to
    /// `OK` and its strikes to zero.
    pub fn register(&self, name: &str, ip: &str, port: u16) {
        let mut inner = self.lock();
        let epoch = inner.epochs;
        inner.epochs += 1;

        inner.nodes.insert(
            name.to_owned(),
            Registration {
                epoch,
                record: NodeRecord {
                    ip: ip.to_owned(),
                    port,
                    status: NodeStatus::Ok,
                    last_seen: OffsetDateTime::now_utc(),
                    last_ping: None,
                    strikes: 0,
                },
            },
        );
    }

    /// The record for `name`, whatever its status.
    pub fn query(&self, name: &str) -> Option<NodeRecord> {
        self.lock().nodes.get(name).map(|r| r.record.clone())
    }

    /// Every node currently `OK`, keyed by name.
    pub fn list_ok(&self) -> BTreeMap<String, NodeRecord> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, r)| r.record.status.is_ok())
            .map(|(name, r)| (name.clone(), r.record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    /// Snapshot the table for one prober sweep.
    pub(crate) fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.lock()
            .nodes
            .iter()
            .map(|(name, r)| ProbeTarget {
                name: name.clone(),
                ip: r.record.ip.clone(),
                port: r.record.port,
                epoch: r.epoch,
            })
            .collect()
    }

    /// Apply one probe result.
    ///
    /// Returns `None` — leaving the table untouched — when the node was
    /// removed or re-registered after the snapshot that produced the probe.
    /// Otherwise the node's status, strikes, and `last_ping` are updated, and
    /// a node that has just accumulated `max_strikes` strikes is evicted.
    pub(crate) fn apply_probe(
        &self,
        name: &str,
        epoch: u64,
        reachable: bool,
    ) -> Option<ProbeOutcome> {
        let mut inner = self.lock();

        let outcome = {
            let registration = inner.nodes.get_mut(name)?;
            if registration.epoch != epoch {
                return None;
            }

            let record = &mut registration.record;
            let previous = record.status;
            record.last_ping = Some(OffsetDateTime::now_utc());

            if reachable {
                record.status = NodeStatus::Ok;
                record.strikes = 0;
            } else {
                record.status = NodeStatus::Fail;
                record.strikes += 1;
            }

            ProbeOutcome {
                previous,
                status: record.status,
                strikes: record.strikes,
                evicted: !reachable && self.max_strikes != 0 && record.strikes >= self.max_strikes,
            }
        };

        if outcome.evicted {
            inner.nodes.remove(name);
        }

        Some(outcome)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
