use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;

/// A mail address of the form `user@node`.
///
/// The node component names a registered mail node, not a DNS hostname; it is
/// resolved to an `ip:port` through the [registry][crate::registry].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub user: String,
    pub node: String,
}

impl Address {
    pub fn new(user: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            node: node.into(),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((user, node)) if !user.is_empty() && !node.is_empty() && !node.contains('@') => {
                Ok(Self::new(user, node))
            }
            _ => Err(Error::Address(s.to_owned())),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.node)
    }
}

/// A stored mail message.
///
/// Records are created by [`MailRecord::compose`] when a client sends mail,
/// serialized whole for cross-node transfer, and held in a
/// [`Mailbox`][crate::node::Mailbox] until the receiver deletes them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRecord {
    /// Unique message id, assigned by the originating node.
    pub id: String,
    /// The full `user@node` address of the sender.
    pub sender: String,
    /// The local user the message is addressed to.
    pub receiver: String,
    pub subject: String,
    pub body: String,
    /// Composition time at the originating node.
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

impl MailRecord {
    /// Compose a new message, stamping it with a fresh [id][mail_id] and the
    /// current time.
    pub fn compose(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: mail_id(),
            sender: sender.into(),
            receiver: receiver.into(),
            subject: subject.into(),
            body: body.into(),
            date: OffsetDateTime::now_utc(),
        }
    }

    /// The header-only view of this message, as returned by a mailbox listing.
    pub fn summary(&self) -> MailSummary {
        MailSummary {
            id: self.id.clone(),
            sender: self.sender.clone(),
            subject: self.subject.clone(),
            date: self.date,
        }
    }
}

/// A mailbox listing entry: everything but the body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailSummary {
    pub id: String,
    pub sender: String,
    pub subject: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

/// Generate a message id.
///
/// Ids are `mail_` followed by a [UUIDv7][Uuid::now_v7], so ids sort roughly
/// by composition time and two messages composed in the same millisecond still
/// get distinct ids.
pub fn mail_id() -> String {
    format!("mail_{}", Uuid::now_v7().simple())
}
