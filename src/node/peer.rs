//! The node-to-node wire protocol.
//!
//! Every connection to a mail node opens with a four-byte kind tag. The
//! registry's prober sends [`PROBE`] and expects [`PROBE_ACK`]; a peer node
//! pushing mail sends [`TRANSFER`] followed by one JSON document per line and
//! expects [`TRANSFER_ACK`] once the mail is queued. Anything else is treated
//! as the first bytes of a client session.

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::mail::MailRecord;

/// Length of the kind tag that opens every connection.
pub(crate) const KIND_LEN: usize = 4;

/// Kind tag of a health probe.
pub(crate) const PROBE: [u8; KIND_LEN] = *b"PING";
/// Reply to a [`PROBE`].
pub(crate) const PROBE_ACK: [u8; KIND_LEN] = *b"PONG";
/// Kind tag of a mail push from a peer node.
pub(crate) const TRANSFER: [u8; KIND_LEN] = *b"MAIL";
/// Acknowledgement that a pushed mail is queued on the receiving node.
pub(crate) const TRANSFER_ACK: [u8; 8] = *b"RECEIVED";

/// A peer document, sent as one JSON line after the [`TRANSFER`] tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Transfer {
    #[serde(rename = "MAIL_TRANSFER")]
    Mail(MailRecord),
}

/// Answer a health probe and let the connection close.
pub(crate) async fn answer_probe<W>(mut writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&PROBE_ACK).await
}

/// Receive one pushed mail: read the document line, queue it on the inbox,
/// and acknowledge.
///
/// The ack is written only after the mail is queued; a malformed document
/// gets no ack at all, and the sending node's retry bookkeeping takes it
/// from there.
pub(crate) async fn receive_transfer<R, W>(
    mut reader: R,
    mut writer: W,
    peer: SocketAddr,
    inbox: &mpsc::UnboundedSender<MailRecord>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => {
            debug!(%peer, "peer closed before sending a document");
            return;
        }
        Ok(_) => {}
        Err(err) => {
            debug!(%peer, %err, "peer read failed");
            return;
        }
    }

    let mail = match serde_json::from_str::<Transfer>(line.trim()) {
        Ok(Transfer::Mail(mail)) => mail,
        Err(err) => {
            warn!(%peer, %err, "rejected malformed mail push");
            return;
        }
    };

    debug!(%peer, id = %mail.id, receiver = %mail.receiver, "accepted inbound mail");
    if inbox.send(mail).is_err() {
        warn!(%peer, "inbox closed; inbound mail dropped unacknowledged");
        return;
    }

    if let Err(err) = writer.write_all(&TRANSFER_ACK).await {
        debug!(%peer, %err, "transfer ack write failed");
    }
}

/// Push a mail to a peer node and wait for its acknowledgement.
///
/// Any shortfall — a failed connect, a dropped connection, a wrong or
/// missing ack, the deadline expiring — is an error; the caller decides
/// whether to retry.
pub(crate) async fn push_mail(
    ip: &str,
    port: u16,
    mail: &MailRecord,
    deadline: Duration,
) -> io::Result<()> {
    let mut line = serde_json::to_string(&Transfer::Mail(mail.clone()))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    line.push('\n');

    let exchange = async move {
        let mut stream = TcpStream::connect((ip, port)).await?;
        stream.write_all(&TRANSFER).await?;
        stream.write_all(line.as_bytes()).await?;

        let mut ack = [0u8; TRANSFER_ACK.len()];
        stream.read_exact(&mut ack).await?;
        if ack == TRANSFER_ACK {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "push not acknowledged",
            ))
        }
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "push timed out"))?
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, BufReader};

    use super::*;

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_transfer_document_shape() {
        let mail = MailRecord::compose("u1@alpha", "u2", "hi", "hello");
        let json = serde_json::to_string(&Transfer::Mail(mail.clone())).unwrap();

        assert!(json.starts_with(r#"{"type":"MAIL_TRANSFER""#), "{json}");
        let Transfer::Mail(back) = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mail);
    }

    #[test]
    fn test_transfer_requires_known_type() {
        let err = serde_json::from_str::<Transfer>(r#"{"type":"MAIL_STEAL","id":"x"}"#);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_receive_acks_after_queueing() {
        let (inbox, mut queued) = mpsc::unbounded_channel();
        let (mut remote, local) = duplex(1024);
        let (read, write) = split(local);

        let mail = MailRecord::compose("u1@alpha", "u2", "hi", "hello");
        let mut doc = serde_json::to_string(&Transfer::Mail(mail.clone())).unwrap();
        doc.push('\n');
        remote.write_all(doc.as_bytes()).await.unwrap();

        receive_transfer(BufReader::new(read), write, peer_addr(), &inbox).await;

        let mut ack = [0u8; TRANSFER_ACK.len()];
        remote.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, TRANSFER_ACK);
        assert_eq!(queued.try_recv().unwrap(), mail);
    }

    #[tokio::test]
    async fn test_malformed_push_is_not_acked() {
        let (inbox, mut queued) = mpsc::unbounded_channel();
        let (mut remote, local) = duplex(1024);
        let (read, write) = split(local);

        remote.write_all(b"this is not json\n").await.unwrap();
        receive_transfer(BufReader::new(read), write, peer_addr(), &inbox).await;

        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "expected EOF, read {buf:?}");
        assert!(queued.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_to_dead_peer_fails() {
        let mail = MailRecord::compose("u1@alpha", "u2", "hi", "hello");
        let err = push_mail("127.0.0.1", 1, &mail, Duration::from_millis(250)).await;
        assert!(err.is_err());
    }
}
