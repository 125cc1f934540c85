use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use herd_lite::agent::AgentId;
use herd_lite::config::{ComputeConfig, RelayClientConfig, ServerConfig};
use herd_lite::grpc::GrpcPortMappingSource;
use herd_lite::node::Node;
use herd_lite::proto::compute_service_client::ComputeServiceClient;
use herd_lite::proto::{
    AllocateComputeRequest, ConnectionMode, ConnectionPreferences, Encryption,
    GetComputeClusterIdRequest, Requirements, ResourceRange,
};
use herd_lite::relay::{AgentRelayClient, Firewall, IptablesFirewall, LoggingFirewall};
use herd_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "herd-lite")]
#[command(version)]
#[command(about = "Lease-based task distribution for a fleet of agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordination server
    Server(ServerArgs),

    /// Run the NAT relay reconciliation loop on a relay agent
    Relay(RelayArgs),

    /// Compute allocation commands
    Compute {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ComputeCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port for the JSON admin API (optional)
    #[arg(long)]
    http_port: Option<u16>,

    /// Compute cluster configuration (JSON)
    #[arg(long, env = "HERD_COMPUTE_CONFIG")]
    compute_config: Option<PathBuf>,

    /// Seconds a session survives without an update
    #[arg(long, default_value = "300")]
    session_grace_secs: u64,

    /// Disable agent software upgrades
    #[arg(long)]
    no_upgrades: bool,

    /// Maximum number of queued jobs
    #[arg(long, default_value = "10000")]
    job_queue_capacity: usize,
}

// =============================================================================
// Relay Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RelayArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Agent ID of this relay
    #[arg(long)]
    agent_id: String,

    /// Compute cluster this relay serves
    #[arg(long)]
    cluster: String,

    /// Addresses of this relay (comma-separated)
    #[arg(long, value_delimiter = ',')]
    ips: Vec<IpAddr>,

    /// Seconds to wait before reconnecting after a failure
    #[arg(long, default_value = "5")]
    cooldown_secs: u64,

    /// iptables binary used to program forwarding rules
    #[arg(long, default_value = "iptables")]
    iptables: String,

    /// Log rule changes instead of applying them
    #[arg(long)]
    dry_run: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Direct,
    Tunnel,
    Relay,
}

#[derive(clap::Subcommand, Debug)]
enum ComputeCommands {
    /// Allocate a compute resource
    Allocate {
        /// Pool the agent must belong to
        #[arg(long, default_value = "")]
        pool: String,

        /// Property condition, e.g. "gpu && os == linux"
        #[arg(long, default_value = "")]
        condition: String,

        /// Minimum resources, format "name=count" (comma-separated)
        #[arg(long, value_delimiter = ',')]
        resource: Vec<String>,

        /// Require a whole agent
        #[arg(long)]
        exclusive: bool,

        /// Extra named ports, format "name=agent_port" (comma-separated)
        #[arg(long, value_delimiter = ',')]
        port: Vec<String>,

        /// Force a connection mode
        #[arg(long)]
        mode: Option<ModeArg>,

        /// Ask for AES session keys
        #[arg(long)]
        aes: bool,

        /// Prefer the agent's public address
        #[arg(long)]
        prefer_public_ip: bool,
    },
    /// Show which cluster would serve this client
    Cluster,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PortOutput {
    name: String,
    port: i32,
    agent_port: i32,
}

#[derive(Serialize)]
struct AllocateOutput {
    lease_id: String,
    agent_id: String,
    agent_version: String,
    cluster_id: String,
    ip: String,
    port: i32,
    connection_mode: String,
    connection_address: String,
    encryption: String,
    ports: Vec<PortOutput>,
    assigned_resources: HashMap<String, i32>,
}

#[derive(Serialize)]
struct ClusterOutput {
    cluster_id: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_pairs(values: &[String]) -> Result<HashMap<String, i32>, Box<dyn std::error::Error>> {
    let mut pairs = HashMap::new();
    for value in values {
        let (name, amount) = value
            .split_once('=')
            .ok_or_else(|| format!("Invalid value {:?}, expected name=number", value))?;
        pairs.insert(name.trim().to_string(), amount.trim().parse()?);
    }
    Ok(pairs)
}

fn connection_mode_to_string(mode: i32) -> String {
    match ConnectionMode::try_from(mode) {
        Ok(ConnectionMode::Direct) => "DIRECT".to_string(),
        Ok(ConnectionMode::Tunnel) => "TUNNEL".to_string(),
        Ok(ConnectionMode::Relay) => "RELAY".to_string(),
        Err(_) => "UNKNOWN".to_string(),
    }
}

fn encryption_to_string(encryption: i32) -> String {
    match Encryption::try_from(encryption) {
        Ok(Encryption::None) => "NONE".to_string(),
        Ok(Encryption::Ssl) => "SSL".to_string(),
        Ok(Encryption::Aes) => "AES".to_string(),
        Err(_) => "UNKNOWN".to_string(),
    }
}

async fn create_client_channel(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    Ok(Channel::from_shared(addr.to_string())?.connect().await?)
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let http_addr: Option<SocketAddr> = match args.http_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let compute = match &args.compute_config {
        Some(path) => ComputeConfig::load(path)?,
        None => ComputeConfig::default(),
    };

    let mut config = ServerConfig::new(listen_addr).with_compute(compute);
    config.http_addr = http_addr;
    config.session.grace_period = Duration::from_secs(args.session_grace_secs);
    config.upgrade.enabled = !args.no_upgrades;
    config.job_queue_capacity = args.job_queue_capacity;

    tracing::info!(
        listen_addr = %config.listen_addr,
        http_addr = ?config.http_addr,
        clusters = ?config.compute.clusters.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
        grace_secs = args.session_grace_secs,
        "Starting herd-lite server"
    );

    let shutdown = install_shutdown_handler()?;
    Node::new(config).run(shutdown).await?;

    Ok(())
}

async fn run_relay(args: RelayArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = RelayClientConfig::new(AgentId::new(args.agent_id), args.cluster)
        .with_cooldown(Duration::from_secs(args.cooldown_secs));
    for ip in args.ips {
        config = config.with_ip(ip);
    }

    let firewall: Arc<dyn Firewall> = if args.dry_run {
        tracing::warn!("Dry run: forwarding rules are logged, not applied");
        Arc::new(LoggingFirewall)
    } else {
        Arc::new(IptablesFirewall::new(args.iptables))
    };
    let source = Arc::new(GrpcPortMappingSource::new(args.addr));

    let shutdown = install_shutdown_handler()?;
    AgentRelayClient::new(config, source, firewall)
        .run(shutdown)
        .await;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_compute_allocate(
    client: &mut ComputeServiceClient<Channel>,
    pool: String,
    condition: String,
    resources: Vec<String>,
    exclusive: bool,
    ports: Vec<String>,
    mode: Option<ModeArg>,
    aes: bool,
    prefer_public_ip: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resources = parse_pairs(&resources)?
        .into_iter()
        .map(|(name, min)| (name, ResourceRange { min, max: None }))
        .collect();
    let mode = mode.map(|m| match m {
        ModeArg::Direct => ConnectionMode::Direct as i32,
        ModeArg::Tunnel => ConnectionMode::Tunnel as i32,
        ModeArg::Relay => ConnectionMode::Relay as i32,
    });
    let encryption = if aes { Encryption::Aes } else { Encryption::None };

    let request = AllocateComputeRequest {
        requirements: Some(Requirements {
            pool,
            condition,
            resources,
            exclusive,
        }),
        connection: Some(ConnectionPreferences {
            prefer_public_ip,
            client_public_ip: String::new(),
            ports: parse_pairs(&ports)?,
            encryption: encryption as i32,
            inactivity_timeout_ms: 0,
            mode,
        }),
        request_id: uuid::Uuid::new_v4().to_string(),
    };

    let response = match client.allocate_compute(request).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Allocation failed: {}", status.message());
            std::process::exit(1);
        }
    };

    let mut ports: Vec<PortOutput> = response
        .ports
        .iter()
        .map(|(name, info)| PortOutput {
            name: name.clone(),
            port: info.port,
            agent_port: info.agent_port,
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));

    match output_format {
        OutputFormat::Json => {
            let output = AllocateOutput {
                lease_id: response.lease_id,
                agent_id: response.agent_id,
                agent_version: response.agent_version,
                cluster_id: response.cluster_id,
                ip: response.ip,
                port: response.port,
                connection_mode: connection_mode_to_string(response.connection_mode),
                connection_address: response.connection_address,
                encryption: encryption_to_string(response.encryption),
                ports,
                assigned_resources: response.assigned_resources,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Lease ID:    {}", response.lease_id);
            println!(
                "Agent:       {} ({})",
                response.agent_id, response.agent_version
            );
            println!("Cluster:     {}", response.cluster_id);
            println!("Address:     {}:{}", response.ip, response.port);
            println!(
                "Connection:  {}",
                connection_mode_to_string(response.connection_mode)
            );
            if !response.connection_address.is_empty() {
                println!("Via:         {}", response.connection_address);
            }
            println!("Encryption:  {}", encryption_to_string(response.encryption));
            if !ports.is_empty() {
                println!();
                println!("{:<16} {:<8} AGENT PORT", "NAME", "PORT");
                println!("{}", "-".repeat(36));
                for port in ports {
                    println!("{:<16} {:<8} {}", port.name, port.port, port.agent_port);
                }
            }
        }
    }
    Ok(())
}

async fn handle_compute_cluster(
    client: &mut ComputeServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get_compute_cluster_id(GetComputeClusterIdRequest {
            connection: Some(ConnectionPreferences::default()),
        })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = ClusterOutput {
                cluster_id: response.cluster_id,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Cluster: {}", response.cluster_id);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Relay(relay_args) => {
            run_relay(relay_args).await?;
        }
        Commands::Compute { client, command } => {
            let channel = create_client_channel(&client.addr).await?;
            let mut grpc_client = ComputeServiceClient::new(channel);

            match command {
                ComputeCommands::Allocate {
                    pool,
                    condition,
                    resource,
                    exclusive,
                    port,
                    mode,
                    aes,
                    prefer_public_ip,
                } => {
                    handle_compute_allocate(
                        &mut grpc_client,
                        pool,
                        condition,
                        resource,
                        exclusive,
                        port,
                        mode,
                        aes,
                        prefer_public_ip,
                        &client.output,
                    )
                    .await?;
                }
                ComputeCommands::Cluster => {
                    handle_compute_cluster(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
