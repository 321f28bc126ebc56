use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::mail::{MailRecord, MailSummary};

/// Per-user mail storage for one node.
///
/// A single lock guards the whole map; client sessions and the delivery
/// drain share it, and every operation is one short critical section.
/// Mailboxes are created on first delivery, so sending to an unknown local
/// user parks the mail until someone logs in under that name.
#[derive(Debug, Default)]
pub struct Mailbox {
    inner: Mutex<HashMap<String, Vec<MailRecord>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a message under its receiver, in arrival order.
    pub fn append(&self, mail: MailRecord) {
        self.lock().entry(mail.receiver.clone()).or_default().push(mail);
    }

    /// Headers of every message held for `user`, oldest first.
    pub fn summaries(&self, user: &str) -> Vec<MailSummary> {
        self.lock()
            .get(user)
            .map(|mails| mails.iter().map(MailRecord::summary).collect())
            .unwrap_or_default()
    }

    /// The full message `id` held for `user`.
    pub fn read(&self, user: &str, id: &str) -> Option<MailRecord> {
        self.lock()
            .get(user)?
            .iter()
            .find(|mail| mail.id == id)
            .cloned()
    }

    /// Delete message `id` held for `user`; `false` if there is no such
    /// message.
    pub fn delete(&self, user: &str, id: &str) -> bool {
        let mut inner = self.lock();
        let Some(mails) = inner.get_mut(user) else {
            return false;
        };

        let before = mails.len();
        mails.retain(|mail| mail.id != id);
        mails.len() < before
    }

    /// Number of messages held for `user`.
    pub fn count(&self, user: &str) -> usize {
        self.lock().get(user).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<MailRecord>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mail(receiver: &str, subject: &str) -> MailRecord {
        MailRecord::compose("u1@alpha", receiver, subject, "body")
    }

    #[test]
    fn test_append_creates_mailbox() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.count("u2"), 0);

        mailbox.append(mail("u2", "first"));
        assert_eq!(mailbox.count("u2"), 1);
        assert_eq!(mailbox.count("u3"), 0);
    }

    #[test]
    fn test_summaries_in_arrival_order() {
        let mailbox = Mailbox::new();
        mailbox.append(mail("u2", "first"));
        mailbox.append(mail("u2", "second"));
        mailbox.append(mail("u3", "other"));

        let listing = mailbox.summaries("u2");
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].subject, "first");
        assert_eq!(listing[1].subject, "second");

        assert!(mailbox.summaries("u4").is_empty());
    }

    #[test]
    fn test_read_by_id() {
        let mailbox = Mailbox::new();
        let wanted = mail("u2", "hello");
        let id = wanted.id.clone();
        mailbox.append(mail("u2", "noise"));
        mailbox.append(wanted.clone());

        assert_eq!(mailbox.read("u2", &id), Some(wanted));
        assert_eq!(mailbox.read("u2", "mail_nope"), None);
        // another user cannot read it
        assert_eq!(mailbox.read("u3", &id), None);
    }

    #[test]
    fn test_delete_is_per_user_and_final() {
        let mailbox = Mailbox::new();
        let doomed = mail("u2", "doomed");
        let id = doomed.id.clone();
        mailbox.append(doomed);

        assert!(!mailbox.delete("u3", &id));
        assert!(mailbox.delete("u2", &id));
        assert!(!mailbox.delete("u2", &id));
        assert_eq!(mailbox.count("u2"), 0);
    }
}
