use chrono::Utc;
use clap::{Parser, Subcommand};
use scorebook::{node_certificate_names, ClusterTls, MembershipClient, MembershipClientError, NodeConfig, NodeEvent};
use slog::Drain;
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scorebook-node")]
#[command(about = "Replicated scoring engine node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node until Ctrl-C.
    Run {
        /// Path to the node's TOML config file.
        #[arg(short, long)]
        config: PathBuf,
        /// Write logs to a timestamped file in this directory instead of the terminal.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Add a running node, started with `join = true`, to an existing cluster.
    AddNode {
        /// Sync address of any current member.
        #[arg(long)]
        cluster: SocketAddr,
        /// Sync address of the node to add.
        #[arg(long)]
        node: SocketAddr,
        #[arg(long, env = "SCOREBOOK_CLUSTER_SECRET")]
        cluster_secret: String,
        /// PEM file of the cluster CA.
        #[arg(long)]
        ca: PathBuf,
    },
    /// Print the node id and the names its certificate must carry. Creates the identity on first
    /// use, so the certificate can be issued before the node's first start.
    Identity {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    match Cli::parse().command {
        Command::Run { config, log_dir } => run(config, log_dir).await,
        Command::AddNode {
            cluster,
            node,
            cluster_secret,
            ca,
        } => add_node(cluster, node, cluster_secret, ClusterTls::load(&ca)?).await,
        Command::Identity { config } => print_identity(config),
    }
}

fn print_identity(config_path: PathBuf) -> Result<(), Box<dyn Error>> {
    let identity = NodeConfig::load(&config_path)?.open_identity()?;
    println!("node id:    {}", identity.node_id());
    println!("public key: {}", identity.public_key_hex());
    println!("cert names: {}", node_certificate_names(identity.node_id()).join(", "));
    Ok(())
}

async fn run(config_path: PathBuf, log_dir: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = NodeConfig::load(&config_path)?;
    let logger = match log_dir {
        Some(dir) => create_root_logger_for_file(dir)?,
        None => create_root_logger_for_stdout(),
    };

    let node_config = config.into_node_config(logger.clone())?;
    let node = scorebook::start_node(node_config).await?;
    slog::info!(logger, "Node {} serving clients on {}", node.node_id(), node.sync_addr());

    let mut events = node.event_listener();
    let event_logger = logger.clone();
    tokio::spawn(async move {
        while let Some(NodeEvent::Election(election)) = events.next_event().await {
            slog::info!(event_logger, "Election state: {:?}", election);
        }
    });

    tokio::signal::ctrl_c().await?;
    slog::info!(logger, "Shutting down");
    node.shutdown();
    Ok(())
}

async fn add_node(
    cluster: SocketAddr,
    node: SocketAddr,
    cluster_secret: String,
    tls: ClusterTls,
) -> Result<(), Box<dyn Error>> {
    let member = MembershipClient::connect(node, cluster_secret.clone(), &tls)
        .await?
        .describe_node()
        .await?;
    println!("Adding {} ({}:{})", member.node_id, member.ip_addr, member.sync_port);

    let mut target = cluster;
    // One redirect is enough unless leadership moves mid-request.
    for _ in 0..3 {
        let mut client = MembershipClient::connect(target, cluster_secret.clone(), &tls).await?;
        match client.add_node(&member).await {
            Ok(added) => {
                println!("Added {}", added.node_id);
                return Ok(());
            }
            Err(MembershipClientError::LeaderRedirect { ip_addr, sync_port, .. }) => {
                target = format!("{}:{}", ip_addr, sync_port).parse()?;
                println!("Redirected to leader at {}", target);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err("Leader kept moving. Try again.".into())
}

fn create_root_logger_for_file(directory: PathBuf) -> Result<slog::Logger, Box<dyn Error>> {
    fs::create_dir_all(&directory)?;
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(directory.join(format!("{}_info.log", now)))?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Ok(slog::Logger::root(drain, slog::o!()))
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
