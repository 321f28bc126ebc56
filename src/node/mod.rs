//! A mail node: the server a set of local users reads and sends mail
//! through.
//!
//! A node listens on a single TCP port. Every inbound connection opens with
//! four bytes that tell the node what it is talking to: `PING` from the
//! registry's prober, `MAIL` from a peer node pushing a message, and
//! anything else from a client starting a command line (every client verb
//! is at least four bytes long, so nothing is lost to the tag read). The
//! tags are reserved words on this port: a client cannot begin a session
//! with them.
//!
//! On startup the node registers its name and advertised address with the
//! registry, then serves connections until [`stopped`][MailNode::stop].
//! Cross-node mail moves through the [delivery pipeline][delivery], never
//! synchronously from a client command.

mod delivery;
mod mailbox;
pub(crate) mod peer;
mod session;

pub use self::{delivery::OutboxEntry, mailbox::Mailbox};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use self::delivery::Drain;
use crate::auth::Users;
use crate::error::Error;
use crate::mail::MailRecord;
use crate::registry::RegistryClient;

/// Configuration for a [`MailNode`].
///
/// Only the node name has no sensible default; build a config with
/// [`NodeConfig::new`] and override fields as needed:
///
/// ```no_run
/// # use postrider::NodeConfig;
/// let config = NodeConfig {
///     bind: ([0, 0, 0, 0], 9001).into(),
///     ..NodeConfig::new("alpha")
/// };
/// ```
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// The name this node registers under, and the `node` half of its
    /// users' `user@node` addresses.
    pub name: String,
    /// Address the node listens on. Port `0` picks a free port.
    pub bind: SocketAddr,
    /// IP published to the registry; peers and clients reach the node at
    /// this IP and the bound port.
    pub advertise_ip: String,
    /// Address of the registry service.
    pub registry: SocketAddr,
    /// The credential table client logins are checked against.
    pub users: Users,
    /// How often the delivery loop drains its queues.
    pub drain_tick: Duration,
    /// How long a batch of failed deliveries is held before it is retried.
    pub retry_delay: Duration,
    /// Delivery attempts per mail before it is dropped.
    pub max_retries: u32,
    /// Deadline for one mail push to a peer node.
    pub push_timeout: Duration,
    /// Deadline for one registry exchange.
    pub registry_timeout: Duration,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_ip: "127.0.0.1".to_owned(),
            registry: SocketAddr::from(([127, 0, 0, 1], 4000)),
            users: Users::new(),
            drain_tick: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            max_retries: 3,
            push_timeout: Duration::from_secs(10),
            registry_timeout: RegistryClient::DEFAULT_TIMEOUT,
        }
    }
}

/// State shared by every connection task and the delivery loop.
pub(crate) struct NodeState {
    pub(crate) name: String,
    pub(crate) users: Users,
    pub(crate) mailbox: Mailbox,
    pub(crate) inbox: mpsc::UnboundedSender<MailRecord>,
    pub(crate) outbox: mpsc::UnboundedSender<OutboxEntry>,
}

/// A running mail node.
///
/// [`MailNode::start`] binds the listener, registers the node with the
/// registry (startup fails if the registry cannot be reached), and spawns
/// the accept loop and the delivery drain. The node does not re-register on
/// its own; a registry that evicted it will only learn of it again on
/// restart.
pub struct MailNode {
    state: Arc<NodeState>,
    local_addr: SocketAddr,
    close: watch::Sender<()>,
    acceptor: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl MailNode {
    pub async fn start(config: NodeConfig) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let state = Arc::new(NodeState {
            name: config.name,
            users: config.users,
            mailbox: Mailbox::new(),
            inbox,
            outbox,
        });
        let (close, stopped) = watch::channel(());

        info!(node = %state.name, %local_addr, "mail node listening");

        // accept before registering, so the registry's first probe of the
        // advertised address cannot land on a closed port
        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&state), stopped.clone()));

        let registry = RegistryClient::with_timeout(config.registry, config.registry_timeout);
        if let Err(err) = registry
            .register(&state.name, &config.advertise_ip, local_addr.port())
            .await
        {
            let _ = close.send(());
            return Err(err);
        }
        info!(
            node = %state.name,
            registry = %config.registry,
            ip = %config.advertise_ip,
            port = local_addr.port(),
            "registered with the registry"
        );

        let drain = tokio::spawn(
            Drain {
                state: Arc::clone(&state),
                registry,
                inbox: inbox_rx,
                outbox: outbox_rx,
                tick: config.drain_tick,
                retry_delay: config.retry_delay,
                max_retries: config.max_retries,
                push_timeout: config.push_timeout,
            }
            .run(stopped),
        );

        Ok(Self {
            state,
            local_addr,
            close,
            acceptor,
            drain,
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// The address the node is listening on (useful after binding port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node's mailbox store, for in-process inspection.
    pub fn mailbox(&self) -> &Mailbox {
        &self.state.mailbox
    }

    /// A handle for queueing outbound mail directly, bypassing the session
    /// protocol.
    pub fn outbox(&self) -> mpsc::UnboundedSender<OutboxEntry> {
        self.state.outbox.clone()
    }

    /// Signal the accept loop and the delivery drain to stop, without
    /// waiting.
    pub fn shutdown(&self) {
        let _ = self.close.send(());
    }

    /// Stop the node and wait for its tasks to wind down.
    pub async fn stop(self) -> io::Result<()> {
        self.shutdown();
        for task in [self.acceptor, self.drain] {
            task.await
                .map_err(|err| io::Error::new(io::ErrorKind::Interrupted, err))?;
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<NodeState>, mut stop: watch::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(serve_connection(stream, peer_addr, state));
                }
                Err(err) => warn!(node = %state.name, %err, "node accept failed"),
            },
            _ = stop.changed() => break,
        }
    }
}

/// Dispatch one inbound connection on its leading four bytes.
async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<NodeState>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut kind = [0u8; peer::KIND_LEN];
    if let Err(err) = reader.read_exact(&mut kind).await {
        debug!(%peer_addr, %err, "connection closed before a kind tag");
        return;
    }

    match kind {
        peer::PROBE => {
            if let Err(err) = peer::answer_probe(&mut write).await {
                debug!(%peer_addr, %err, "probe ack failed");
            }
        }
        peer::TRANSFER => peer::receive_transfer(reader, write, peer_addr, &state.inbox).await,
        _ => {
            // the four bytes open a client command line; replay them
            let replay = (&kind[..]).chain(reader);
            session::serve(replay, write, peer_addr, &state).await;
        }
    }
}
