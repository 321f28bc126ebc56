use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use super::prober::Prober;
use super::protocol::{Request, Response, ServerList};
use super::record::RegistryStore;

/// Configuration for a [`Registry`].
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Address the registry listens on.
    pub bind: SocketAddr,
    /// How often the prober sweeps the registered nodes.
    pub probe_interval: Duration,
    /// How long a probed node has to answer.
    pub probe_timeout: Duration,
    /// Failed probes a node may accumulate before it is evicted; `0`
    /// disables eviction.
    pub max_strikes: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4000)),
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            max_strikes: 3,
        }
    }
}

/// A running registry service.
///
/// [`Registry::start`] binds the listener and spawns two tasks: an accept
/// loop that serves the line-oriented JSON protocol, and a [`Prober`] that
/// health-checks every registered node. Both wind down on
/// [`shutdown`][Registry::shutdown] or [`stop`][Registry::stop].
#[derive(Debug)]
pub struct Registry {
    store: Arc<RegistryStore>,
    local_addr: SocketAddr,
    close: watch::Sender<()>,
    acceptor: JoinHandle<()>,
    prober: JoinHandle<()>,
}

impl Registry {
    pub async fn start(config: RegistryConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        let store = Arc::new(RegistryStore::new(config.max_strikes));
        let (close, stopped) = watch::channel(());

        info!(%local_addr, "registry listening");

        let acceptor = tokio::spawn(accept_loop(listener, Arc::clone(&store), stopped.clone()));
        let prober = tokio::spawn(
            Prober {
                store: Arc::clone(&store),
                interval: config.probe_interval,
                timeout: config.probe_timeout,
            }
            .run(stopped),
        );

        Ok(Self {
            store,
            local_addr,
            close,
            acceptor,
            prober,
        })
    }

    /// The address the registry is listening on (useful after binding
    /// port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The backing node table, for in-process inspection.
    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Signal the accept loop and the prober to stop, without waiting.
    pub fn shutdown(&self) {
        let _ = self.close.send(());
    }

    /// Stop the registry and wait for its tasks to wind down.
    pub async fn stop(self) -> io::Result<()> {
        self.shutdown();
        for task in [self.acceptor, self.prober] {
            task.await
                .map_err(|err| io::Error::new(io::ErrorKind::Interrupted, err))?;
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, store: Arc<RegistryStore>, mut stop: watch::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(stream, peer, Arc::clone(&store)));
                }
                Err(err) => warn!(%err, "registry accept failed"),
            },
            _ = stop.changed() => break,
        }
    }
}

/// Serve one connection: any number of request lines, one response line each.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, store: Arc<RegistryStore>) {
    debug!(%peer, "registry connection opened");

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%peer, %err, "registry read failed");
                break;
            }
        }

        let mut response = handle(line.trim(), &store).to_json();
        response.push('\n');
        if let Err(err) = write.write_all(response.as_bytes()).await {
            debug!(%peer, %err, "registry write failed");
            break;
        }
    }

    debug!(%peer, "registry connection closed");
}

/// Apply one request line to the store.
fn handle(line: &str, store: &RegistryStore) -> Response {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return Response::InvalidJson;
    };
    let Ok(request) = serde_json::from_value::<Request>(value) else {
        return Response::InvalidRequest;
    };

    match request {
        Request::Register { server, ip, port } => {
            store.register(&server, &ip, port);
            info!(node = %server, %ip, port, "registered node");
            Response::Registered
        }
        Request::Query { server } => match store.query(&server) {
            Some(record) => Response::Record(record),
            None => Response::Miss,
        },
        Request::List => Response::Servers(ServerList {
            servers: store.list_ok(),
        }),
    }
}
