//! hostbroker CLI
//!
//! Thin front-end over the command and query buses. All state lives in the
//! core; the CLI parses arguments, runs one use case and prints JSON.

use anyhow::Result;
use clap::{Parser, Subcommand};
use hostbroker::app::commands::{
    CancelRequest, CreateAcquisitionRequest, CreateReturnRequest, ReloadProviderConfig,
    ReloadTemplates,
};
use hostbroker::app::queries::{
    GetMachinesByRequest, GetProviderInfo, GetRequestStatus, GetTemplate, ListRequests,
    ListTemplates, ValidateProviderConfig,
};
use hostbroker::app::wiring::build_production_app;
use hostbroker::domain::RequestStatus;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hostbroker", version, about = "Host-factory plugin for batch schedulers")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, short, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(long, default_value = "hostbroker.toml")]
        output: PathBuf,
    },
    /// Submit an acquisition request
    Request {
        /// Template id
        template_id: String,
        /// Number of machines
        count: u32,
        /// Request priority (1-5)
        #[arg(long)]
        priority: Option<u8>,
        /// Timeout in minutes
        #[arg(long)]
        timeout: Option<i64>,
        /// Requester identity, for tagging
        #[arg(long)]
        requester: Option<String>,
    },
    /// Return machines to the provider
    Return {
        /// Machine ids to return
        #[arg(required = true)]
        machine_ids: Vec<String>,
        /// Reason recorded on the request
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel a pending or processing request
    Cancel {
        request_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Show a request, optionally syncing provider state first
    Status {
        request_id: String,
        /// Poll the provider before reporting
        #[arg(long)]
        sync: bool,
    },
    /// List requests
    Requests {
        /// Filter by status (pending, processing, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },
    /// List machines owned by a request
    Machines { request_id: String },
    /// Run one lifecycle sweep over all open requests
    Poll,
    /// Run continuously: periodic lifecycle sweeps plus provider health probes
    Watch {
        /// Seconds between sweeps
        #[arg(long, default_value = "30")]
        interval: u64,
    },
    /// Template operations
    Templates {
        #[command(subcommand)]
        subcommand: TemplateCommands,
    },
    /// Provider operations
    Providers {
        #[command(subcommand)]
        subcommand: ProviderCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// List all templates
    List,
    /// Show one template
    Show { template_id: String },
    /// Reload template files from disk
    Reload,
}

#[derive(Subcommand)]
enum ProviderCommands {
    /// Show provider instances and their metrics
    Info,
    /// Validate every template against its selected provider
    Validate,
    /// Reload provider configuration
    Reload,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(broker_error) = e.downcast_ref::<hostbroker::BrokerError>() {
            eprintln!("error [{}]: {broker_error}", broker_error.error_code());
            std::process::exit(hostbroker::exit_codes::exit_code_for_error(broker_error));
        }
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hostbroker=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::InitConfig { output } = &cli.command {
        hostbroker::config::init_config(output)?;
        return Ok(());
    }

    let app = build_production_app(cli.config.clone()).await?;

    match cli.command {
        Commands::InitConfig { .. } => unreachable!("handled above"),
        Commands::Request { template_id, count, priority, timeout, requester } => {
            let mut command = CreateAcquisitionRequest::new(&template_id, count);
            command.priority = priority;
            command.timeout_minutes = timeout;
            command.requester_id = requester;
            command.tags = HashMap::new();
            let request_id = app.commands.execute(command).await?;
            println!("{request_id}");
        }
        Commands::Return { machine_ids, reason } => {
            let request_id =
                app.commands.execute(CreateReturnRequest { machine_ids, reason }).await?;
            println!("{request_id}");
        }
        Commands::Cancel { request_id, reason } => {
            let id = app.commands.execute(CancelRequest { request_id, reason }).await?;
            println!("{id}");
        }
        Commands::Status { request_id, sync } => {
            if sync {
                app.lifecycle.sync_request(&request_id).await?;
            }
            let view = app.queries.execute(GetRequestStatus { request_id }).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Requests { status } => {
            let status = match status.as_deref() {
                None => None,
                Some(s) => Some(parse_status(s)?),
            };
            let requests = app.queries.execute(ListRequests { status }).await?;
            println!("{}", serde_json::to_string_pretty(&requests)?);
        }
        Commands::Machines { request_id } => {
            let machines = app.queries.execute(GetMachinesByRequest { request_id }).await?;
            println!("{}", serde_json::to_string_pretty(&machines)?);
        }
        Commands::Poll => {
            let synced = app.lifecycle.sync_all().await?;
            println!("synced {synced} requests");
        }
        Commands::Watch { interval } => {
            let _health = hostbroker::app::wiring::spawn_health_probes(app.core.clone());
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
            loop {
                ticker.tick().await;
                match app.lifecycle.sync_all().await {
                    Ok(synced) => tracing::info!("Lifecycle sweep synced {} requests", synced),
                    Err(e) => tracing::warn!("Lifecycle sweep failed: {}", e),
                }
            }
        }
        Commands::Templates { subcommand } => match subcommand {
            TemplateCommands::List => {
                let templates = app.queries.execute(ListTemplates).await?;
                println!("{}", serde_json::to_string_pretty(&templates)?);
            }
            TemplateCommands::Show { template_id } => {
                let template = app.queries.execute(GetTemplate { template_id }).await?;
                println!("{}", serde_json::to_string_pretty(&template)?);
            }
            TemplateCommands::Reload => {
                let count = app.commands.execute(ReloadTemplates).await?;
                println!("reloaded {count} templates");
            }
        },
        Commands::Providers { subcommand } => match subcommand {
            ProviderCommands::Info => {
                let info = app.queries.execute(GetProviderInfo).await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            ProviderCommands::Validate => {
                let report = app.queries.execute(ValidateProviderConfig).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            ProviderCommands::Reload => {
                let count = app.commands.execute(ReloadProviderConfig).await?;
                println!("registered {count} provider strategies");
            }
        },
    }

    Ok(())
}

fn parse_status(value: &str) -> Result<RequestStatus> {
    match value {
        "pending" => Ok(RequestStatus::Pending),
        "processing" => Ok(RequestStatus::Processing),
        "completed" => Ok(RequestStatus::Completed),
        "failed" => Ok(RequestStatus::Failed),
        "cancelled" => Ok(RequestStatus::Cancelled),
        other => anyhow::bail!("unknown status '{other}'"),
    }
}
