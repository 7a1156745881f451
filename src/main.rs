use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use workqueue::api::{run_api, ApiState};
use workqueue::catalog::InMemoryCatalog;
use workqueue::remote::HttpQueueClient;
use workqueue::scheduler::{ElementSelector, ElementStatus, WorkQueueElement};
use workqueue::service::MaintenanceService;
use workqueue::shutdown::install_shutdown_handler;
use workqueue::{QueueConfig, WorkQueue};

#[derive(Parser, Debug)]
#[command(name = "workqueue")]
#[command(version)]
#[command(about = "Hierarchical work queue: split workloads and hand them out to site capacity")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a queue and serve its HTTP API
    Serve(ServeArgs),

    /// Queue a workload spec on a running queue
    QueueWork {
        #[command(flatten)]
        client: ClientArgs,

        /// Path or file:// URL of the workload spec, as seen by the queue
        url: String,

        /// Element id of the work in the parent queue
        #[arg(long)]
        parent_queue_id: Option<u64>,
    },

    /// List the elements of a running queue
    Elements {
        #[command(flatten)]
        client: ClientArgs,

        /// Only elements with this status
        #[arg(long)]
        status: Option<ElementStatus>,
    },

    /// Set the status of elements by id
    SetStatus {
        #[command(flatten)]
        client: ClientArgs,

        status: ElementStatus,

        /// Element ids
        #[arg(required = true)]
        ids: Vec<u64>,
    },

    /// Set the priority of every live element of the given workflows
    SetPriority {
        #[command(flatten)]
        client: ClientArgs,

        priority: u32,

        #[arg(required = true)]
        workflows: Vec<String>,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Queue configuration (JSON, option names as keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to serve the API on
    #[arg(long, default_value = "0.0.0.0:8240")]
    listen: SocketAddr,

    /// Data catalog dump (JSON: dataset -> blocks) used as the default catalog
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Override ReportInterval, in seconds
    #[arg(long)]
    maintenance_interval: Option<u64>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Queue address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8240")]
    addr: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl ClientArgs {
    fn client(&self) -> workqueue::Result<HttpQueueClient> {
        HttpQueueClient::new(&self.addr, Duration::from_secs(self.timeout))
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = match args.config {
        Some(ref path) => QueueConfig::from_file(path)?,
        None => QueueConfig::default(),
    };

    let mut builder = WorkQueue::builder(config);
    if let Some(ref path) = args.catalog {
        builder = builder.default_catalog(Arc::new(InMemoryCatalog::from_file(path)?));
    }
    let queue = Arc::new(builder.build()?);

    let shutdown = install_shutdown_handler()?;

    let mut maintenance = MaintenanceService::new(queue.clone());
    if let Some(secs) = args.maintenance_interval {
        maintenance = maintenance.with_interval(Duration::from_secs(secs));
    }
    let maintenance_shutdown = shutdown.clone();
    let maintenance_task = tokio::spawn(async move {
        maintenance.run(maintenance_shutdown).await;
    });

    tracing::info!(
        listen = %args.listen,
        queue_url = ?queue.config().queue_url,
        parent_queue = ?queue.config().parent_queue,
        "Starting work queue"
    );
    run_api(args.listen, ApiState { queue }, shutdown.clone()).await?;

    shutdown.cancel();
    if let Err(e) = maintenance_task.await {
        tracing::error!(error = %e, "Maintenance task ended abnormally");
    }
    tracing::info!("Work queue stopped");
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_elements(
    elements: &[WorkQueueElement],
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(elements)?),
        OutputFormat::Table => {
            if elements.is_empty() {
                println!("No elements found.");
                return Ok(());
            }
            println!(
                "{:<8} {:<12} {:<24} {:<16} {:>6} {:>8} {:<30}",
                "ID", "STATUS", "WORKLOAD", "TASK", "JOBS", "PRIORITY", "INPUT"
            );
            println!("{}", "-".repeat(110));
            for e in elements {
                println!(
                    "{:<8} {:<12} {:<24} {:<16} {:>6} {:>8} {:<30}",
                    e.id,
                    e.status.to_string(),
                    e.workload_name,
                    e.task_name,
                    e.jobs,
                    e.priority,
                    e.input.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

fn print_updated(what: &str, updated: usize, output: &OutputFormat) {
    match output {
        OutputFormat::Json => println!("{{\"updated\": {}}}", updated),
        OutputFormat::Table => println!("{} updated on {} element(s)", what, updated),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
        Commands::QueueWork {
            client,
            url,
            parent_queue_id,
        } => {
            let units = client.client()?.queue_work(&url, parent_queue_id).await?;
            match client.output {
                OutputFormat::Json => println!("{{\"units\": {}}}", units),
                OutputFormat::Table => println!("Queued {} element(s) from {}", units, url),
            }
        }
        Commands::Elements { client, status } => {
            let elements = client.client()?.elements(status).await?;
            print_elements(&elements, &client.output)?;
        }
        Commands::SetStatus {
            client,
            status,
            ids,
        } => {
            let updated = client
                .client()?
                .set_status(status, ElementSelector::Ids(ids))
                .await?;
            print_updated("Status", updated, &client.output);
        }
        Commands::SetPriority {
            client,
            priority,
            workflows,
        } => {
            let updated = client.client()?.set_priority(priority, workflows).await?;
            print_updated("Priority", updated, &client.output);
        }
    }

    Ok(())
}
