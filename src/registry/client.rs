use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use super::protocol::{self, ListReply, QueryReply, Request};
use super::record::NodeRecord;
use crate::error::Error;

/// A client for the registry protocol.
///
/// Each call opens a fresh connection and performs one request/response
/// exchange under a deadline. The registry happily serves many requests per
/// connection, but its callers here never need more than one at a time.
#[derive(Clone, Copy, Debug)]
pub struct RegistryClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl RegistryClient {
    /// Default per-exchange deadline.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(addr: SocketAddr) -> Self {
        Self::with_timeout(addr, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// Announce a node, overwriting any existing record under the same name.
    pub async fn register(&self, server: &str, ip: &str, port: u16) -> Result<(), Error> {
        let request = Request::Register {
            server: server.to_owned(),
            ip: ip.to_owned(),
            port,
        };

        let reply = self.exchange(&request).await?;
        let ack: String = serde_json::from_str(&reply)?;
        if ack == protocol::REGISTERED {
            Ok(())
        } else {
            Err(Error::Protocol(ack))
        }
    }

    /// Look up a node by name.
    ///
    /// `Ok(None)` means the registry has no record: the node never
    /// registered, or has been evicted.
    pub async fn query(&self, server: &str) -> Result<Option<NodeRecord>, Error> {
        let request = Request::Query {
            server: server.to_owned(),
        };

        let reply = self.exchange(&request).await?;
        match serde_json::from_str::<QueryReply>(&reply)? {
            QueryReply::Record(record) => Ok(Some(record)),
            QueryReply::Status(_) => Ok(None),
            QueryReply::Token(token) => Err(Error::Protocol(token)),
        }
    }

    /// Look up a node and require it to be usable: present, with status `OK`.
    pub async fn resolve(&self, server: &str) -> Result<NodeRecord, Error> {
        match self.query(server).await? {
            Some(record) if record.status.is_ok() => Ok(record),
            _ => Err(Error::Unresolved(server.to_owned())),
        }
    }

    /// Every node currently `OK`, keyed by name.
    pub async fn list(&self) -> Result<BTreeMap<String, NodeRecord>, Error> {
        let reply = self.exchange(&Request::List).await?;
        match serde_json::from_str::<ListReply>(&reply)? {
            ListReply::Servers(list) => Ok(list.servers),
            ListReply::Token(token) => Err(Error::Protocol(token)),
        }
    }

    async fn exchange(&self, request: &Request) -> Result<String, Error> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let exchange = async {
            let stream = TcpStream::connect(self.addr).await?;
            let (read, mut write) = stream.into_split();
            write.write_all(line.as_bytes()).await?;

            let mut reply = String::new();
            if BufReader::new(read).read_line(&mut reply).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "registry closed the connection",
                ));
            }
            Ok(reply)
        };

        let reply = timeout(self.timeout, exchange)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "registry request timed out"))??;

        Ok(reply.trim().to_owned())
    }
}
