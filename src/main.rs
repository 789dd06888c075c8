use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tractus_edge::api::ApiServerBuilder;
use tractus_edge::db::{self, IdempotencyRepo, LedgerStatus};
use tractus_edge::protocol::modbus::{DEFAULT_PORT as MODBUS_DEFAULT_PORT, ModbusSimulator};
use tractus_edge::Config;

/// Tractus edge - at-most-once device commands over OPC UA and Modbus TCP
#[derive(Parser)]
#[command(name = "tractus", version, about)]
struct Cli {
    /// HTTP port to listen on
    #[arg(long, env = "TRACTUS_PORT")]
    port: Option<u16>,

    /// Idempotency ledger database file
    #[arg(long = "db", env = "TRACTUS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Serve OPC UA from an in-memory demo address space
    #[arg(long)]
    simulate_opcua: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway (default)
    Serve,
    /// Run a Modbus TCP device simulator
    SimModbus {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to bind
        #[arg(long, default_value_t = MODBUS_DEFAULT_PORT)]
        port: u16,
    },
    /// Inspect the idempotency ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
}

#[derive(Subcommand)]
enum LedgerCommand {
    /// Print the record for an idempotency key
    Show {
        /// Idempotency key
        key: String,
    },
    /// List records that never reached a terminal status
    Pending,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,tractus_edge=info",
        1 => "info,tractus_edge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.db_path {
        config.db_path = path;
    }
    if cli.simulate_opcua {
        config.simulate_opcua = true;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::SimModbus { host, port } => sim_modbus(&host, port).await,
        Command::Ledger { action } => ledger(&config, action),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        port = config.port,
        db = %config.db_path.display(),
        opcua_endpoint = %config.opcua_endpoint,
        "starting tractus edge gateway"
    );
    tracing::debug!(?config, "loaded configuration");

    let pool = open_ledger(&config)?;

    let server = ApiServerBuilder::new(pool, config.port)
        .api_key(config.api_key)
        .opcua_endpoint(config.opcua_endpoint)
        .simulate_opcua(config.simulate_opcua)
        .dispatch_timeout(config.dispatch_timeout)
        .connect_timeout(config.connect_timeout)
        .rate_limit_per_minute(config.rate_limit_per_minute)
        .max_body_bytes(config.max_body_bytes)
        .build();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

async fn sim_modbus(host: &str, port: u16) -> anyhow::Result<()> {
    let simulator = ModbusSimulator::default();
    let listener = tokio::net::TcpListener::bind((host, port)).await?;

    tokio::select! {
        result = simulator.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("simulator stopped"),
    }

    Ok(())
}

fn ledger(config: &Config, action: LedgerCommand) -> anyhow::Result<()> {
    let repo = IdempotencyRepo::new(open_ledger(config)?);

    match action {
        LedgerCommand::Show { key } => {
            let record = repo
                .get(&key)?
                .ok_or_else(|| anyhow::anyhow!("no record for idempotency key {key}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        LedgerCommand::Pending => {
            let records = repo.list_by_status(LedgerStatus::Accepted)?;
            if records.is_empty() {
                println!("no pending records");
            }
            for record in records {
                println!(
                    "{}  {}  {}  {}",
                    record.created_at, record.key, record.device_id, record.capability
                );
            }
        }
    }

    Ok(())
}

fn open_ledger(config: &Config) -> anyhow::Result<db::DbPool> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(db::init(&config.db_path)?)
}
