//! Tidelog - Durable Replicated Transaction Log
//!
//! Service entry point: loads the TOML configuration and runs the
//! replication master and/or slave for this node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tidelog::config::{TcpRole, TidelogConfig};
use tidelog::error::Result;
use tidelog::network::ReplicationServer;
use tidelog::replication::{ReplicationMaster, ReplicationSlave};
use tidelog::stream::StreamRegistry;

/// Tidelog - Durable Replicated Transaction Log
#[derive(Parser)]
#[command(name = "tidelog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tidelog.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured replication services
    Start,

    /// Validate the configuration file
    Validate,

    /// Write a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tidelog.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await?,
        Commands::Validate => run_validate(cli.config)?,
        Commands::Init { output } => run_init(output)?,
    }
    Ok(())
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = match TidelogConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Starting tidelog instance {}", config.node.instance);
    std::fs::create_dir_all(&config.node.data_dir)?;

    // local streams are created up front; the data-producing side
    // attaches to them through the registry
    let registry = Arc::new(StreamRegistry::new());
    if let Some(master_cfg) = &config.master {
        for name in &master_cfg.streams {
            registry.create(name);
        }
    }
    if let Some(slave_cfg) = &config.slave {
        for mapping in &slave_cfg.streams {
            registry.create(&mapping.local);
        }
    }

    let needs_server = config
        .master
        .as_ref()
        .map(|m| m.tcp_role == TcpRole::Server)
        .unwrap_or(false)
        || config
            .slave
            .as_ref()
            .map(|s| s.tcp_role == TcpRole::Server)
            .unwrap_or(false);
    let server = if needs_server {
        let server_cfg = config.server.as_ref().expect("validated");
        Some(ReplicationServer::new(
            server_cfg.listen.clone(),
            server_cfg.max_tuple_size,
        ))
    } else {
        None
    };

    let master = match &config.master {
        Some(master_cfg) => {
            let master = ReplicationMaster::new(
                config.node.instance.clone(),
                config.node.instance_id,
                master_cfg.clone(),
                &config.node.data_dir,
                registry.clone(),
            )?;
            master.start()?;
            if let Some(server) = &server {
                server.register_master(master.clone());
            }
            Some(master)
        }
        None => None,
    };

    let slave = match &config.slave {
        Some(slave_cfg) => {
            let slave = ReplicationSlave::new(
                config.node.instance.clone(),
                config.node.instance_id,
                slave_cfg.clone(),
                &config.node.data_dir,
                registry.clone(),
            )?;
            slave.start()?;
            if let Some(server) = &server {
                server.register_slave(slave.clone());
            }
            Some(slave)
        }
        None => None,
    };

    if let Some(server) = &server {
        server.start().await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    if let Some(server) = &server {
        server.stop();
    }
    if let Some(slave) = &slave {
        slave.stop();
    }
    if let Some(master) = &master {
        master.stop()?;
    }
    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match TidelogConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration {} is valid", config_path.display());
            println!("  instance: {}", config.node.instance);
            if let Some(master) = &config.master {
                println!("  master: {} stream(s)", master.streams.len());
            }
            if let Some(slave) = &config.slave {
                println!("  slave: {} stream mapping(s)", slave.streams.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration {} is invalid: {}", config_path.display(), e);
            Err(e)
        }
    }
}

fn run_init(output: PathBuf) -> Result<()> {
    const SAMPLE: &str = r#"[node]
instance = "ops"
instance_id = 1
data_dir = "/var/lib/tidelog"

[server]
listen = "0.0.0.0:8099"

[master]
streams = ["tm_realtime"]
tcp_role = "server"
page_size = 500
max_pages = 500
max_file_size_kb = 102400
expiration_days = 7.0

# Slave on the receiving node:
#
# [slave]
# tcp_role = "client"
# master_host = "10.0.0.1"
# master_port = 8099
# master_instance = "ops"
#
# [[slave.streams]]
# remote = "tm_realtime"
# local = "tm_local"
"#;
    std::fs::write(&output, SAMPLE)?;
    println!("Wrote sample configuration to {}", output.display());
    Ok(())
}
