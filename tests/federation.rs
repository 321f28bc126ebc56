//! End-to-end scenarios over loopback TCP: a registry, one or more mail
//! nodes, and clients speaking the real wire protocols.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

use postrider::{
    MailNode, MailRecord, MailSummary, NodeConfig, Registry, RegistryClient, RegistryConfig, Users,
};

/// Drain tick used by test nodes.
const TICK: Duration = Duration::from_millis(50);
/// How long a test waits for an asynchronous effect before giving up.
const DEADLINE: Duration = Duration::from_secs(5);

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A registry that never probes on its own; probing behavior has its own
/// tests with a fast interval.
async fn start_registry() -> Registry {
    Registry::start(RegistryConfig {
        bind: loopback(),
        probe_interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_millis(250),
        max_strikes: 3,
    })
    .await
    .expect("registry failed to start")
}

async fn start_probing_registry() -> Registry {
    Registry::start(RegistryConfig {
        bind: loopback(),
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(250),
        max_strikes: 3,
    })
    .await
    .expect("registry failed to start")
}

fn node_config(name: &str, registry: &Registry) -> NodeConfig {
    NodeConfig {
        bind: loopback(),
        registry: registry.local_addr(),
        users: Users::demo(),
        drain_tick: TICK,
        retry_delay: Duration::from_millis(100),
        push_timeout: Duration::from_millis(500),
        ..NodeConfig::new(name)
    }
}

/// One client connection speaking the line protocol.
struct Session {
    replies: BufReader<OwnedReadHalf>,
    write: OwnedWriteHalf,
}

impl Session {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        let (read, write) = stream.into_split();
        Self {
            replies: BufReader::new(read),
            write,
        }
    }

    async fn login(addr: SocketAddr, user: &str, password: &str) -> Self {
        let mut session = Self::connect(addr).await;
        let reply = session.cmd(&format!("LOGIN::{user}::{password}")).await;
        assert_eq!(reply, "OK", "login as {user} failed");
        session
    }

    /// Send one command line and read the one-line reply.
    async fn cmd(&mut self, line: &str) -> String {
        self.write
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("command write failed");

        let mut reply = String::new();
        let n = timeout(DEADLINE, self.replies.read_line(&mut reply))
            .await
            .expect("timed out waiting for a reply")
            .expect("reply read failed");
        assert!(n > 0, "connection closed awaiting a reply to {line:?}");
        reply.trim_end().to_owned()
    }

    async fn list(&mut self) -> Vec<MailSummary> {
        let reply = self.cmd("LIST").await;
        serde_json::from_str(&reply).expect("LIST reply was not a summary document")
    }

    async fn assert_closed(mut self) {
        let mut line = String::new();
        let n = timeout(DEADLINE, self.replies.read_line(&mut line))
            .await
            .expect("timed out waiting for the server to close")
            .expect("read failed");
        assert_eq!(n, 0, "expected the connection to close, got {line:?}");
    }
}

#[tokio::test]
async fn test_registry_round_trip() {
    let registry = start_registry().await;
    let client = RegistryClient::new(registry.local_addr());

    client.register("alpha", "10.0.0.7", 9001).await.unwrap();
    let listed = client.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed["alpha"].ip, "10.0.0.7");
    assert_eq!(listed["alpha"].port, 9001);
    assert!(listed["alpha"].status.is_ok());

    assert!(client.query("beta").await.unwrap().is_none());

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_registry_wire_errors_keep_the_connection() {
    let registry = start_registry().await;
    let client = RegistryClient::new(registry.local_addr());
    client.register("alpha", "10.0.0.7", 9001).await.unwrap();

    let stream = TcpStream::connect(registry.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut replies = BufReader::new(read);
    let mut reply = String::new();

    write.write_all(b"this is not json\n").await.unwrap();
    replies.read_line(&mut reply).await.unwrap();
    assert_eq!(reply.trim_end(), r#""INVALID_JSON""#);

    reply.clear();
    write
        .write_all(b"{\"type\":\"REMOVE\",\"server\":\"alpha\"}\n")
        .await
        .unwrap();
    replies.read_line(&mut reply).await.unwrap();
    assert_eq!(reply.trim_end(), r#""INVALID_REQUEST""#);

    // a miss is a status document, not an error
    reply.clear();
    write
        .write_all(b"{\"type\":\"QUERY\",\"server\":\"nobody\"}\n")
        .await
        .unwrap();
    replies.read_line(&mut reply).await.unwrap();
    assert_eq!(reply.trim_end(), r#"{"status":"FAIL"}"#);

    // the same connection still serves valid requests
    reply.clear();
    write.write_all(b"{\"type\":\"LIST\"}\n").await.unwrap();
    replies.read_line(&mut reply).await.unwrap();
    let listing: serde_json::Value = serde_json::from_str(reply.trim_end()).unwrap();
    assert_eq!(listing["servers"]["alpha"]["port"], 9001);

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_prober_keeps_live_node_listed() {
    let registry = start_probing_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();
    let client = RegistryClient::new(registry.local_addr());

    // several probe sweeps
    sleep(Duration::from_millis(500)).await;

    let record = client.query("alpha").await.unwrap().expect("alpha evicted");
    assert!(record.status.is_ok());
    assert_eq!(record.strikes, 0);
    assert!(record.last_ping.is_some(), "alpha was never probed");
    assert!(client.list().await.unwrap().contains_key("alpha"));

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_prober_strikes_failing_node_then_evicts() {
    let registry = start_probing_registry().await;
    let client = RegistryClient::new(registry.local_addr());

    // nothing listens on port 1; every probe is refused
    client.register("ghost", "127.0.0.1", 1).await.unwrap();

    // before eviction the node is still queryable, marked FAIL, and unlisted
    let deadline = Instant::now() + DEADLINE;
    loop {
        match client.query("ghost").await.unwrap() {
            Some(record) if !record.status.is_ok() => {
                assert!(record.strikes >= 1);
                assert!(!client.list().await.unwrap().contains_key("ghost"));
                break;
            }
            Some(_) => {}
            None => panic!("ghost evicted before a FAIL was observable"),
        }
        assert!(Instant::now() < deadline, "ghost never went FAIL");
        sleep(Duration::from_millis(10)).await;
    }

    // the third failed probe removes the record entirely
    let deadline = Instant::now() + DEADLINE;
    while client.query("ghost").await.unwrap().is_some() {
        assert!(Instant::now() < deadline, "ghost was never evicted");
        sleep(Duration::from_millis(10)).await;
    }

    // re-registering resurrects the name with a clean record
    client.register("ghost", "127.0.0.1", 1).await.unwrap();
    assert!(client.query("ghost").await.unwrap().is_some());

    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_local_send_is_visible_immediately() {
    let registry = start_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();

    let mut sender = Session::login(node.local_addr(), "u1", "p1").await;
    assert_eq!(sender.cmd("SEND::u2@alpha::hi::hello").await, "SEND_OK");

    // no eventual-consistency window for local delivery
    let mut receiver = Session::login(node.local_addr(), "u2", "p2").await;
    let listing = receiver.list().await;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].subject, "hi");
    assert_eq!(listing[0].sender, "u1@alpha");

    let full = receiver.cmd(&format!("READ::{}", listing[0].id)).await;
    let mail: MailRecord = serde_json::from_str(&full).unwrap();
    assert_eq!(mail.body, "hello");
    assert_eq!(mail.receiver, "u2");

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_remote_send_crosses_nodes() {
    let registry = start_registry().await;
    let alpha = MailNode::start(node_config("alpha", &registry)).await.unwrap();
    let beta = MailNode::start(node_config("beta", &registry)).await.unwrap();

    let mut sender = Session::login(alpha.local_addr(), "u1", "p1").await;
    assert_eq!(sender.cmd("SEND::u3@beta::x::y").await, "SEND_QUEUED");

    // nothing lands on alpha; the drain resolves beta and pushes
    assert!(alpha.mailbox().summaries("u3").is_empty());

    let mut carol = Session::login(beta.local_addr(), "u3", "p3").await;
    let deadline = Instant::now() + DEADLINE;
    let listing = loop {
        let listing = carol.list().await;
        if !listing.is_empty() {
            break listing;
        }
        assert!(Instant::now() < deadline, "mail never reached beta");
        sleep(TICK).await;
    };

    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].subject, "x");
    assert_eq!(listing[0].sender, "u1@alpha");

    let full = carol.cmd(&format!("READ::{}", listing[0].id)).await;
    let mail: MailRecord = serde_json::from_str(&full).unwrap();
    assert_eq!(mail.body, "y");

    alpha.stop().await.unwrap();
    beta.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_to_unreachable_node_does_not_block() {
    let registry = start_registry().await;
    let client = RegistryClient::new(registry.local_addr());

    // a peer that accepts connections and never answers
    let tarpit = TcpListener::bind(loopback()).await.unwrap();
    let tarpit_addr = tarpit.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = tarpit.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _stream = stream;
                sleep(Duration::from_secs(60)).await;
            });
        }
    });
    client
        .register("tarpit", "127.0.0.1", tarpit_addr.port())
        .await
        .unwrap();

    let node = MailNode::start(NodeConfig {
        push_timeout: Duration::from_secs(10),
        ..node_config("alpha", &registry)
    })
    .await
    .unwrap();

    let mut sender = Session::login(node.local_addr(), "u1", "p1").await;
    let started = Instant::now();
    assert_eq!(sender.cmd("SEND::u9@tarpit::slow::x").await, "SEND_QUEUED");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "SEND waited on the remote peer"
    );

    // the drain is now stuck in a 10s push; tear down without joining it
    node.shutdown();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_outbox_attempts_exactly_max_retries_times() {
    let registry = start_registry().await;
    let client = RegistryClient::new(registry.local_addr());

    // a peer that counts mail pushes and never acknowledges them
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let ghost_addr = listener.local_addr().unwrap();
    let pushes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pushes);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut kind = [0u8; 4];
                if stream.read_exact(&mut kind).await.is_err() {
                    return;
                }
                if &kind == b"PING" {
                    let _ = stream.write_all(b"PONG").await;
                } else if &kind == b"MAIL" {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // close without acknowledging
                }
            });
        }
    });
    client
        .register("ghost", "127.0.0.1", ghost_addr.port())
        .await
        .unwrap();

    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();
    let mut sender = Session::login(node.local_addr(), "u1", "p1").await;
    assert_eq!(sender.cmd("SEND::u9@ghost::doomed::x").await, "SEND_QUEUED");

    let deadline = Instant::now() + DEADLINE;
    while pushes.load(Ordering::SeqCst) < 3 {
        assert!(Instant::now() < deadline, "delivery was not retried");
        sleep(Duration::from_millis(10)).await;
    }

    // with max_retries = 3 the third failure is final: no further attempts
    sleep(Duration::from_millis(500)).await;
    assert_eq!(pushes.load(Ordering::SeqCst), 3);

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_all_land() {
    let registry = start_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();
    let addr = node.local_addr();

    let mut tasks = Vec::new();
    for task in 0..8 {
        tasks.push(tokio::spawn(async move {
            let mut session = Session::login(addr, "u1", "p1").await;
            for i in 0..5 {
                let reply = session.cmd(&format!("SEND::u2@alpha::t{task}-{i}::body")).await;
                assert_eq!(reply, "SEND_OK");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut receiver = Session::login(addr, "u2", "p2").await;
    let listing = receiver.list().await;
    assert_eq!(listing.len(), 40);

    let subjects: std::collections::BTreeSet<String> =
        listing.into_iter().map(|mail| mail.subject).collect();
    let expected: std::collections::BTreeSet<String> = (0..8)
        .flat_map(|task| (0..5).map(move |i| format!("t{task}-{i}")))
        .collect();
    assert_eq!(subjects, expected);

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_delete_semantics() {
    let registry = start_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();

    let mut sender = Session::login(node.local_addr(), "u1", "p1").await;
    assert_eq!(sender.cmd("SEND::u2@alpha::first::1").await, "SEND_OK");
    assert_eq!(sender.cmd("SEND::u2@alpha::second::2").await, "SEND_OK");

    let mut receiver = Session::login(node.local_addr(), "u2", "p2").await;
    let listing = receiver.list().await;
    assert_eq!(listing.len(), 2);

    let doomed = &listing[0].id;
    assert_eq!(receiver.cmd(&format!("DELETE::{doomed}")).await, "DELETE_OK");
    assert_eq!(receiver.cmd(&format!("DELETE::{doomed}")).await, "DELETE_FAIL");
    assert_eq!(receiver.cmd("DELETE::mail_bogus").await, "DELETE_FAIL");

    let listing = receiver.list().await;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].subject, "second");

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_session_errors_do_not_end_the_connection() {
    let registry = start_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();

    let mut session = Session::connect(node.local_addr()).await;
    assert_eq!(session.cmd("LIST").await, "LOGIN_REQUIRED");
    assert_eq!(session.cmd("LOGIN::u1::wrong").await, "LOGIN_FAIL");
    assert_eq!(session.cmd("MAKE::me::coffee").await, "INVALID_CMD");

    // the same connection can still authenticate
    assert_eq!(session.cmd("LOGIN::u1::p1").await, "OK");
    assert_eq!(session.cmd("LOGIN::u2::p2").await, "LOGIN_FAIL");

    assert_eq!(session.cmd("SEND::u2::missing-node::x").await, "INVALID_RECEIVER");
    assert_eq!(session.cmd("READ::mail_bogus").await, "NOT_FOUND");

    assert_eq!(session.cmd("LOGOUT").await, "BYE");
    session.assert_closed().await;

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

#[tokio::test]
async fn test_peer_push_wire_contract() {
    let registry = start_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();

    let doc = serde_json::json!({
        "type": "MAIL_TRANSFER",
        "id": "mail_feedbeef",
        "sender": "u9@elsewhere",
        "receiver": "u2",
        "subject": "pushed",
        "body": "over the wire",
        "date": "2026-08-25T12:00:00Z",
    });

    let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();
    stream.write_all(b"MAIL").await.unwrap();
    stream.write_all(format!("{doc}\n").as_bytes()).await.unwrap();
    let mut ack = [0u8; 8];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"RECEIVED");

    // the ack means "queued"; the drain merges it into the mailbox
    let mut receiver = Session::login(node.local_addr(), "u2", "p2").await;
    let deadline = Instant::now() + DEADLINE;
    let listing = loop {
        let listing = receiver.list().await;
        if !listing.is_empty() {
            break listing;
        }
        assert!(Instant::now() < deadline, "pushed mail never merged");
        sleep(TICK).await;
    };
    assert_eq!(listing[0].id, "mail_feedbeef");
    assert_eq!(listing[0].subject, "pushed");

    // a malformed push is closed without an ack and merges nothing
    let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();
    stream.write_all(b"MAILnot a document\n").await.unwrap();
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "malformed push was acknowledged: {buf:?}");

    sleep(TICK * 4).await;
    assert_eq!(receiver.list().await.len(), 1);

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}

/// The full discovery flow: a node registers at startup, a client finds it
/// through the registry, and mail sent to one of its users shows up in that
/// user's listing.
#[tokio::test]
async fn test_end_to_end_discovery_flow() {
    let registry = start_registry().await;
    let node = MailNode::start(node_config("alpha", &registry)).await.unwrap();

    let client = RegistryClient::new(registry.local_addr());
    assert!(client.list().await.unwrap().contains_key("alpha"));

    let record = client.resolve("alpha").await.unwrap();
    let addr: SocketAddr = format!("{}:{}", record.ip, record.port).parse().unwrap();
    assert_eq!(addr.port(), node.local_addr().port());

    let mut sender = Session::login(addr, "u1", "p1").await;
    assert_eq!(sender.cmd("SEND::u2@alpha::hi::hello").await, "SEND_OK");

    let mut receiver = Session::login(addr, "u2", "p2").await;
    let listing = receiver.list().await;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].subject, "hi");

    node.stop().await.unwrap();
    registry.stop().await.unwrap();
}
