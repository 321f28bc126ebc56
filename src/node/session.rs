//! The client session protocol: newline-terminated text commands with
//! `::`-separated fields.
//!
//! ```text
//! LOGIN::<user>::<password>            OK | LOGIN_FAIL
//! LOGOUT                               BYE (connection closes)
//! LIST                                 JSON array of message headers
//! READ::<mail_id>                      JSON message | NOT_FOUND
//! DELETE::<mail_id>                    DELETE_OK | DELETE_FAIL
//! SEND::<user@node>::<subject>::<body> SEND_OK | SEND_QUEUED | INVALID_RECEIVER
//! ```
//!
//! Mailbox commands before a successful `LOGIN` are answered with
//! `LOGIN_REQUIRED`; a line that parses as no command at all with
//! `INVALID_CMD`. `SEND_OK` means the mail is already in a local mailbox;
//! `SEND_QUEUED` means it entered the outbound pipeline, which resolves and
//! retries in the background, so the only immediate `SEND` failure is
//! `INVALID_RECEIVER`.

use std::net::SocketAddr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::delivery::OutboxEntry;
use super::NodeState;
use crate::mail::{Address, MailRecord};

/// A parsed client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Login { id: String, password: String },
    Logout,
    List,
    Read { id: String },
    Delete { id: String },
    Send { to: String, subject: String, body: String },
}

/// The line could not be parsed as any command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BadCommand;

impl Command {
    /// Parse one line.
    ///
    /// Verbs are case-insensitive. `SEND` splits its remainder at most
    /// twice, so only the body may contain the `::` separator; `LOGOUT` and
    /// `LIST` ignore anything after the verb.
    pub(crate) fn parse(line: &str) -> Result<Self, BadCommand> {
        let (verb, rest) = match line.split_once("::") {
            Some((verb, rest)) => (verb, Some(rest)),
            None => (line, None),
        };

        match verb.to_ascii_uppercase().as_str() {
            "LOGIN" => {
                let fields: Vec<&str> = rest.ok_or(BadCommand)?.split("::").collect();
                match fields[..] {
                    [id, password] if !id.is_empty() => Ok(Self::Login {
                        id: id.to_owned(),
                        password: password.to_owned(),
                    }),
                    _ => Err(BadCommand),
                }
            }
            "LOGOUT" => Ok(Self::Logout),
            "LIST" => Ok(Self::List),
            "READ" => Ok(Self::Read { id: first_field(rest)? }),
            "DELETE" => Ok(Self::Delete { id: first_field(rest)? }),
            "SEND" => {
                let mut fields = rest.ok_or(BadCommand)?.splitn(3, "::");
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(to), Some(subject), Some(body)) => Ok(Self::Send {
                        to: to.to_owned(),
                        subject: subject.to_owned(),
                        body: body.to_owned(),
                    }),
                    _ => Err(BadCommand),
                }
            }
            _ => Err(BadCommand),
        }
    }
}

fn first_field(rest: Option<&str>) -> Result<String, BadCommand> {
    match rest.ok_or(BadCommand)?.split("::").next() {
        Some(field) if !field.is_empty() => Ok(field.to_owned()),
        _ => Err(BadCommand),
    }
}

/// A reply token or document line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Ok,
    LoginFail,
    LoginRequired,
    Bye,
    SendOk,
    SendQueued,
    InvalidCmd,
    InvalidReceiver,
    DeleteOk,
    DeleteFail,
    NotFound,
    Json(String),
}

impl Reply {
    pub(crate) fn as_line(&self) -> &str {
        match self {
            Self::Ok => "OK",
            Self::LoginFail => "LOGIN_FAIL",
            Self::LoginRequired => "LOGIN_REQUIRED",
            Self::Bye => "BYE",
            Self::SendOk => "SEND_OK",
            Self::SendQueued => "SEND_QUEUED",
            Self::InvalidCmd => "INVALID_CMD",
            Self::InvalidReceiver => "INVALID_RECEIVER",
            Self::DeleteOk => "DELETE_OK",
            Self::DeleteFail => "DELETE_FAIL",
            Self::NotFound => "NOT_FOUND",
            Self::Json(doc) => doc,
        }
    }
}

/// Apply one command to the session and node state.
pub(crate) fn apply(command: Command, user: &mut Option<String>, state: &NodeState) -> Reply {
    match command {
        Command::Login { id, password } => {
            if user.is_some() {
                // a live session cannot re-authenticate
                return Reply::LoginFail;
            }
            if state.users.verify(&id, &password) {
                info!(node = %state.name, user = %id, "user logged in");
                *user = Some(id);
                Reply::Ok
            } else {
                Reply::LoginFail
            }
        }
        Command::Logout => Reply::Bye,
        Command::List => {
            let Some(user) = user else {
                return Reply::LoginRequired;
            };
            Reply::Json(json_line(&state.mailbox.summaries(user)))
        }
        Command::Read { id } => {
            let Some(user) = user else {
                return Reply::LoginRequired;
            };
            match state.mailbox.read(user, &id) {
                Some(mail) => Reply::Json(json_line(&mail)),
                None => Reply::NotFound,
            }
        }
        Command::Delete { id } => {
            let Some(user) = user else {
                return Reply::LoginRequired;
            };
            if state.mailbox.delete(user, &id) {
                Reply::DeleteOk
            } else {
                Reply::DeleteFail
            }
        }
        Command::Send { to, subject, body } => {
            let Some(user) = user else {
                return Reply::LoginRequired;
            };
            let Ok(address) = to.parse::<Address>() else {
                return Reply::InvalidReceiver;
            };

            let mail = MailRecord::compose(
                format!("{user}@{}", state.name),
                address.user,
                subject,
                body,
            );

            if address.node == state.name {
                state.mailbox.append(mail);
                Reply::SendOk
            } else {
                debug!(
                    node = %state.name,
                    id = %mail.id,
                    target = %address.node,
                    "queued outbound mail"
                );
                if state.outbox.send(OutboxEntry::new(mail, address.node)).is_err() {
                    warn!(node = %state.name, "outbox closed; queued mail dropped");
                }
                Reply::SendQueued
            }
        }
    }
}

fn json_line<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("mailbox documents always serialize")
}

/// Drive one client session to completion.
pub(crate) async fn serve<R, W>(mut reader: R, mut writer: W, peer: SocketAddr, state: &NodeState)
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(node = %state.name, %peer, "client session opened");

    let mut user = None;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%peer, %err, "session read failed");
                break;
            }
        }

        let reply = match Command::parse(line.trim()) {
            Ok(command) => apply(command, &mut user, state),
            Err(BadCommand) => Reply::InvalidCmd,
        };

        let mut out = reply.as_line().to_owned();
        out.push('\n');
        if let Err(err) = writer.write_all(out.as_bytes()).await {
            debug!(%peer, %err, "session write failed");
            break;
        }

        if reply == Reply::Bye {
            break;
        }
    }

    info!(
        node = %state.name,
        %peer,
        user = user.as_deref().unwrap_or("-"),
        "client session closed"
    );
}
