mod auth;
mod error;
mod mail;
pub mod node;
pub mod registry;
mod timing;

pub use self::{
    auth::Users,
    error::Error,
    mail::{mail_id, Address, MailRecord, MailSummary},
    node::{MailNode, Mailbox, NodeConfig, OutboxEntry},
    registry::{NodeRecord, NodeStatus, Registry, RegistryClient, RegistryConfig, RegistryStore},
};
