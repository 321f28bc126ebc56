use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, trace, warn};

use super::record::{ProbeTarget, RegistryStore};
use crate::node::peer::{PROBE, PROBE_ACK};
use crate::timing;

/// The registry's health-check loop.
///
/// Every interval it snapshots the node table and probes each node in turn;
/// results feed back through [`RegistryStore::apply_probe`], which accumulates
/// strikes and evicts. Probes run outside the store lock, so registrations and
/// queries never wait on a slow node.
pub(crate) struct Prober {
    pub(crate) store: Arc<RegistryStore>,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
}

impl Prober {
    pub(crate) async fn run(self, mut stop: watch::Receiver<()>) {
        let mut ticks = timing::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticks.tick() => self.sweep().await,
                _ = stop.changed() => break,
            }
        }
    }

    async fn sweep(&self) {
        for target in self.store.probe_targets() {
            let reachable = probe(&target, self.timeout).await;

            let Some(outcome) = self.store.apply_probe(&target.name, target.epoch, reachable)
            else {
                // re-registered or removed while the probe was in flight
                continue;
            };

            if outcome.evicted {
                error!(
                    node = %target.name,
                    strikes = outcome.strikes,
                    "evicted unreachable node"
                );
            } else if outcome.status != outcome.previous {
                warn!(
                    node = %target.name,
                    from = ?outcome.previous,
                    to = ?outcome.status,
                    "node status changed"
                );
            } else if !reachable {
                debug!(node = %target.name, strikes = outcome.strikes, "probe failed");
            }
        }
    }
}

/// Probe one node: connect, send [`PROBE`], and require [`PROBE_ACK`] within
/// the deadline.
async fn probe(target: &ProbeTarget, deadline: Duration) -> bool {
    let exchange = async {
        let mut stream = TcpStream::connect((target.ip.as_str(), target.port)).await?;
        stream.write_all(&PROBE).await?;

        let mut ack = [0u8; PROBE_ACK.len()];
        stream.read_exact(&mut ack).await?;
        Ok::<_, io::Error>(ack == PROBE_ACK)
    };

    match timeout(deadline, exchange).await {
        Ok(Ok(acked)) => acked,
        Ok(Err(err)) => {
            trace!(node = %target.name, %err, "probe error");
            false
        }
        Err(_) => {
            trace!(node = %target.name, "probe timed out");
            false
        }
    }
}
