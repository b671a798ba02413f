use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use reqwest::Client;
use std::time::Duration;

use meshrelay::rpc::{RpcRequest, RpcResponse};

#[derive(Parser, Debug)]
#[command(name = "relay-cli")]
#[command(about = "Relay daemon RPC client", long_about = None)]
struct Args {
    /// RPC server address (host:port or URL)
    #[arg(short, long, default_value = "127.0.0.1:8892")]
    rpc_addr: String,

    /// Output compact JSON (single line)
    #[arg(long)]
    compact: bool,

    /// Seconds to wait for the daemon
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "lowercase")]
enum Commands {
    /// Submit a transaction through this node's relay pipeline
    Submit {
        /// Payload text, or hex prefixed with 0x
        payload: String,
        /// Requester latitude
        #[arg(long, requires = "lon")]
        lat: Option<f64>,
        /// Requester longitude
        #[arg(long, requires = "lat")]
        lon: Option<f64>,
        /// Preferred partition (alpha through zeta)
        #[arg(long)]
        affinity: Option<String>,
    },

    /// Fan a transaction out to bridge endpoints (bridge nodes only)
    Dispatch {
        payload: String,
        #[arg(long)]
        affinity: Option<String>,
        /// Endpoint names; defaults to every configured target
        #[arg(long = "target")]
        targets: Vec<String>,
    },

    /// List known nodes with their health
    Health,

    /// Show the routing score of every known node
    Routing,

    /// Register a node by hand
    Register {
        node_id: String,
        /// core or relay
        kind: String,
        address: String,
        partition: String,
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },

    /// Record a heartbeat for a node
    Heartbeat { node_id: String, latency_ms: u64 },

    /// Relay throughput and failure counters
    Metrics,

    /// Node identity and role
    Info,

    /// Get daemon uptime
    Uptime,

    /// Stop the daemon
    Stop,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run_command(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_command(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let (method, params) = match &args.command {
        Commands::Submit {
            payload,
            lat,
            lon,
            affinity,
        } => {
            let coordinate = match (lat, lon) {
                (Some(lat), Some(lon)) => json!({"latitude": lat, "longitude": lon}),
                _ => Value::Null,
            };
            ("submittransaction", json!([payload, coordinate, affinity]))
        }
        Commands::Dispatch {
            payload,
            affinity,
            targets,
        } => {
            let targets = if targets.is_empty() {
                Value::Null
            } else {
                json!(targets)
            };
            ("dispatch", json!([payload, null, affinity, targets]))
        }
        Commands::Health => ("getnodehealth", json!([])),
        Commands::Routing => ("getroutingsnapshot", json!([])),
        Commands::Register {
            node_id,
            kind,
            address,
            partition,
            latency_ms,
        } => (
            "registernode",
            json!([node_id, kind, address, partition, latency_ms]),
        ),
        Commands::Heartbeat {
            node_id,
            latency_ms,
        } => ("heartbeat", json!([node_id, latency_ms])),
        Commands::Metrics => ("getmetrics", json!([])),
        Commands::Info => ("getnodeinfo", json!([])),
        Commands::Uptime => ("uptime", json!([])),
        Commands::Stop => ("stop", json!([])),
    };

    let request = RpcRequest {
        jsonrpc: "2.0".to_string(),
        id: "relay-cli".to_string(),
        method: method.to_string(),
        params,
    };

    let client = Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()?;
    let rpc_response = post(&client, &args.rpc_addr, &request).await?;

    if let Some(error) = rpc_response.error {
        return Err(format!("RPC error {}: {}", error.code, error.message).into());
    }

    if let Some(result) = rpc_response.result {
        if args.compact {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

async fn post(
    client: &Client,
    addr: &str,
    request: &RpcRequest,
) -> Result<RpcResponse, Box<dyn std::error::Error>> {
    let url = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    };
    let response = client.post(&url).json(request).send().await?;

    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()).into());
    }

    Ok(response.json::<RpcResponse>().await?)
}
