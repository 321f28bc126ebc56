//! Run a little mail federation on your own machine: one registry, a few
//! named nodes, and an interactive client.
//!
//! ```console
//! $ postrider-demo registry
//! $ postrider-demo node alpha
//! $ postrider-demo node beta
//! $ postrider-demo client alpha
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::Level;

use postrider::{MailNode, NodeConfig, Registry, RegistryClient, RegistryConfig, Users};

/// A toy federated mail network.
#[derive(Parser)]
#[command(name = "postrider", version, about)]
struct App {
    /// Log level.
    #[arg(long, default_value_t = Level::INFO)]
    log: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the discovery registry.
    Registry {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:4000")]
        listen: SocketAddr,
        /// Seconds between health-probe sweeps.
        #[arg(long, default_value_t = 10)]
        probe_interval: u64,
        /// Failed probes before a node is evicted; 0 keeps nodes forever.
        #[arg(long, default_value_t = 3)]
        max_strikes: u32,
    },
    /// Run a mail node and register it.
    Node {
        /// Name to register under.
        name: String,
        /// Address to listen on; port 0 picks a free port.
        #[arg(long, default_value = "0.0.0.0:0")]
        listen: SocketAddr,
        /// Registry to register with.
        #[arg(long, default_value = "127.0.0.1:4000")]
        registry: SocketAddr,
        /// IP published to the registry.
        #[arg(long, default_value = "127.0.0.1")]
        advertise_ip: String,
    },
    /// Resolve a node by name and type commands at it.
    Client {
        /// Registry to resolve against.
        #[arg(long, default_value = "127.0.0.1:4000")]
        registry: SocketAddr,
        /// Node to connect to; omit to list the registered nodes instead.
        node: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let app = App::parse();
    tracing_subscriber::fmt().with_max_level(app.log).init();

    match app.command {
        Command::Registry {
            listen,
            probe_interval,
            max_strikes,
        } => run_registry(listen, probe_interval, max_strikes).await,
        Command::Node {
            name,
            listen,
            registry,
            advertise_ip,
        } => run_node(name, listen, registry, advertise_ip).await,
        Command::Client { registry, node } => run_client(registry, node).await,
    }
}

async fn run_registry(listen: SocketAddr, probe_interval: u64, max_strikes: u32) {
    let registry = Registry::start(RegistryConfig {
        bind: listen,
        probe_interval: Duration::from_secs(probe_interval),
        max_strikes,
        ..RegistryConfig::default()
    })
    .await
    .expect("failed to start the registry");

    println!("registry listening on {}", registry.local_addr());
    tokio::signal::ctrl_c().await.expect("failed to wait for ctrl-c");
    registry.stop().await.expect("registry did not stop cleanly");
}

async fn run_node(name: String, listen: SocketAddr, registry: SocketAddr, advertise_ip: String) {
    let node = MailNode::start(NodeConfig {
        bind: listen,
        registry,
        advertise_ip,
        users: Users::demo(),
        ..NodeConfig::new(name)
    })
    .await
    .expect("failed to start the node");

    println!(
        "node {} listening on {} (demo logins: u1/p1 through u4/p4)",
        node.name(),
        node.local_addr()
    );
    tokio::signal::ctrl_c().await.expect("failed to wait for ctrl-c");
    node.stop().await.expect("node did not stop cleanly");
}

async fn run_client(registry: SocketAddr, node: Option<String>) {
    let client = RegistryClient::new(registry);

    let Some(name) = node else {
        let nodes = client.list().await.expect("failed to list the registry");
        println!(
            "{}",
            serde_json::to_string_pretty(&nodes).expect("listing is always serializable")
        );
        return;
    };

    let record = client
        .resolve(&name)
        .await
        .expect("the registry could not resolve that node");
    let addr = format!("{}:{}", record.ip, record.port);
    let stream = TcpStream::connect(&addr)
        .await
        .expect("failed to connect to the node");

    println!("connected to {name} at {addr}");
    println!("commands: LOGIN::user::password  LIST  READ::id  DELETE::id  SEND::user@node::subject::body  LOGOUT");

    let (read, mut write) = stream.into_split();
    let mut replies = BufReader::new(read).lines();
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = input.next_line().await.expect("stdin read failed") {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Err(err) = write.write_all(format!("{line}\n").as_bytes()).await {
            eprintln!("write failed: {err}");
            break;
        }

        match replies.next_line().await {
            Ok(Some(reply)) => {
                println!("{reply}");
                if reply == "BYE" {
                    break;
                }
            }
            Ok(None) => {
                eprintln!("the node closed the connection");
                break;
            }
            Err(err) => {
                eprintln!("read failed: {err}");
                break;
            }
        }
    }
}
