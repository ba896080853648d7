mod cmd;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "panelctl")]
#[command(about = "talk to the hosting control plane as an agent or an operator", version, author)]
struct Cli {
    /// Control plane base URL
    #[arg(long, env = "PANEL_URL", default_value = "http://127.0.0.1:8088", global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register this host as an agent and store the issued credentials
    Register {
        #[arg(long, env = "PANEL_BOOTSTRAP_TOKEN")]
        bootstrap_token: String,
        /// Defaults to the local hostname
        #[arg(long)]
        name: Option<String>,
        /// Roles this agent advertises (repeat flag for multiple)
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Send a signed heartbeat
    Heartbeat {
        #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
        version: String,
        /// Report this host as a Windows node
        #[arg(long, default_value_t = false)]
        windows: bool,
        /// Currently open firewall ports, e.g. tcp:25565 (repeatable)
        #[arg(long = "open-port")]
        open_ports: Vec<String>,
    },
    /// Lease queued jobs and print them
    Poll {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Report the final outcome of a leased job
    Result {
        job_id: String,
        /// succeeded | failed | cancelled
        #[arg(long, default_value = "succeeded")]
        status: String,
        /// JSON object with the job output
        #[arg(long)]
        output: Option<String>,
        #[arg(long)]
        lock_token: Option<String>,
    },
    /// Append progress or log lines to a running job
    Log {
        job_id: String,
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        progress: Option<i64>,
        #[arg(long)]
        lock_token: Option<String>,
    },
    /// Operator commands (bearer admin token)
    Job {
        #[arg(long, env = "PANEL_ADMIN_TOKEN")]
        admin_token: String,
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Debug, Subcommand)]
enum JobAction {
    /// Enqueue a job; payload given as key=value pairs
    Create {
        #[arg(long = "type")]
        job_type: String,
        #[arg(long = "set")]
        payload: Vec<String>,
    },
    /// Show a job with its result and logs
    Get { job_id: String },
    /// Cancel a queued job
    Cancel { job_id: String },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Register { bootstrap_token, name, roles } => cmd::register(&url, bootstrap_token, name, roles).await,
        Commands::Heartbeat { version, windows, open_ports } => cmd::heartbeat(&url, version, windows, open_ports).await,
        Commands::Poll { limit } => cmd::poll(&url, limit).await,
        Commands::Result { job_id, status, output, lock_token } => cmd::result(&url, job_id, status, output, lock_token).await,
        Commands::Log { job_id, message, progress, lock_token } => cmd::log(&url, job_id, message, progress, lock_token).await,
        Commands::Job { admin_token, action } => match action {
            JobAction::Create { job_type, payload } => cmd::job_create(&url, &admin_token, job_type, payload).await,
            JobAction::Get { job_id } => cmd::job_get(&url, &admin_token, &job_id).await,
            JobAction::Cancel { job_id } => cmd::job_cancel(&url, &admin_token, &job_id).await,
        },
    }
}
