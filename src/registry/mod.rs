//! The discovery registry.
//!
//! Mail nodes register a name → `ip:port` mapping here; the registry probes
//! every registered node on an interval, marks unresponsive nodes `FAIL`, and
//! evicts them after enough consecutive failures. Clients and peer nodes
//! resolve names through [`RegistryClient`] before connecting.

mod client;
mod prober;
mod protocol;
mod record;
mod server;

pub use self::{
    client::RegistryClient,
    record::{NodeRecord, NodeStatus, RegistryStore},
    server::{Registry, RegistryConfig},
};
