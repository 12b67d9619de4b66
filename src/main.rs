use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use opqueue::api::{
    ArchiveJobResponse, AutoArchiveRequest, AutoArchiveResponse, DrainRequest, JobListItem,
    JobResponse, SubmitJobRequest, SubmitJobResponse,
};
use opqueue::config::{HookFailurePolicy, MasterConfig, DEFAULT_RPC_PORT};
use opqueue::locking::LockInfo;
use opqueue::master::Master;
use opqueue::opcodes::OpInput;
use opqueue::scheduler::job::OpResult;
use opqueue::scheduler::{CancelOutcome, JobChange, JobId, JobStatus, QueueInfo};
use opqueue::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "opqueue")]
#[command(version)]
#[command(about = "Cluster master job queue with an opcode processor and lock manager")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the master daemon
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Queue management commands
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Show held and pending locks
    Locks {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address the API listens on
    #[arg(long, default_value = "127.0.0.1:5080")]
    listen: SocketAddr,

    /// Directory holding job files
    #[arg(long, default_value = "/var/lib/opqueue/queue")]
    queue_dir: PathBuf,

    /// Number of worker tasks
    #[arg(long, default_value = "25")]
    workers: usize,

    /// Cluster configuration file (created if missing; in-memory when unset)
    #[arg(long)]
    cluster_config: Option<PathBuf>,

    /// What a failing post-execution hook does to its opcode
    #[arg(long, value_enum, default_value = "warn")]
    hook_failure_policy: HookFailurePolicy,

    /// Port node daemons listen on
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    rpc_port: u16,

    /// Job files allowed in the queue directory before submissions are refused
    #[arg(long, default_value = "5000")]
    max_jobs: usize,

    /// Archive finished jobs older than this many seconds
    #[arg(long)]
    auto_archive_age: Option<u64>,
}

// =============================================================================
// Client Arguments (shared by all client commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Master API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:5080")]
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

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        /// Opcodes as a JSON array, or @FILE to read them from a file
        ops: String,

        /// Priority for opcodes that do not set one (-10, 0 or 10)
        #[arg(long, allow_hyphen_values = true)]
        priority: Option<i32>,
    },
    /// Show a job
    Status { job_id: JobId },
    /// List jobs
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,

        /// Include archived jobs
        #[arg(long)]
        archived: bool,
    },
    /// Cancel a job
    Cancel { job_id: JobId },
    /// Follow a job's log until it finishes
    Wait {
        job_id: JobId,

        /// Give up after this many seconds
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },
    /// Archive a finished job
    Archive { job_id: JobId },
}

// =============================================================================
// Queue Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Show queue state
    Info,
    /// Stop accepting new jobs
    Drain,
    /// Accept new jobs again
    Undrain,
    /// Archive finished jobs
    Archive {
        /// Only jobs finished at least this many seconds ago
        #[arg(long)]
        age: Option<u64>,

        /// Time budget in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Long-poll slice used by `job wait`.
const WAIT_POLL_SECS: u64 = 30;

fn read_ops(arg: &str) -> Result<Vec<OpInput>, Box<dyn std::error::Error>> {
    let data = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&data)?)
}

/// Send a request and decode the JSON answer, turning error bodies into errors.
async fn send<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, Box<dyn std::error::Error>> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let message = body
        .get("error")
        .and_then(|e| e.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    Err(message.into())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_result(result: &Option<OpResult>) -> String {
    match result {
        None => "-".to_string(),
        Some(OpResult::Value(value)) => value.to_string(),
        Some(OpResult::Error(error)) => error.to_string(),
        Some(OpResult::Message(message)) => message.clone(),
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = MasterConfig::new(args.listen, args.queue_dir).with_workers(args.workers);
    config.queue = config.queue.with_max_live_jobs(args.max_jobs);
    config.cluster_config_path = args.cluster_config;
    config.hook_failure_policy = args.hook_failure_policy;
    config.rpc.port = args.rpc_port;
    config.auto_archive_age_secs = args.auto_archive_age;

    let shutdown = install_shutdown_handler();
    let master = Master::new(config)?;
    master.run(shutdown).await;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    ops: String,
    priority: Option<i32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = SubmitJobRequest {
        ops: read_ops(&ops)?,
        priority,
    };
    let response: SubmitJobResponse =
        send(http.post(format!("{}/api/jobs", client.addr)).json(&request)).await?;
    match client.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if let Some(job_id) = response.job_id {
                println!("Job submitted successfully!");
                println!("Job ID: {}", job_id);
            }
        }
    }
    Ok(())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: JobId,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: JobResponse =
        send(http.get(format!("{}/api/jobs/{}", client.addr, job_id))).await?;
    match client.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            let job = &response.job;
            println!("Job ID:    {}", job.id);
            println!("Status:    {}", response.status);
            println!("Priority:  {}", response.priority);
            println!("Received:  {}", job.received_timestamp);
            if let Some(start) = job.start_timestamp {
                println!("Started:   {}", start);
            }
            if let Some(end) = job.end_timestamp {
                println!("Finished:  {}", end);
            }
            println!();
            println!("{:<4} {:<40} {:<10} RESULT", "#", "OPCODE", "STATUS");
            println!("{}", "-".repeat(78));
            for (index, op) in job.ops.iter().enumerate() {
                println!(
                    "{:<4} {:<40} {:<10} {}",
                    index,
                    op.input.summary(),
                    op.status.to_string(),
                    format_result(&op.result)
                );
                for entry in &op.log {
                    println!("       {} {}", entry.timestamp, entry.message);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
    status: Option<JobStatus>,
    archived: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut query: Vec<(&str, String)> = vec![("archived", archived.to_string())];
    if let Some(status) = status {
        query.push(("status", status.to_string()));
    }
    let jobs: Vec<JobListItem> =
        send(http.get(format!("{}/api/jobs", client.addr)).query(&query)).await?;

    match client.output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<8} {:<10} {:<6} SUMMARY", "JOB ID", "STATUS", "PRIO");
                println!("{}", "-".repeat(78));
                for job in &jobs {
                    println!(
                        "{:<8} {:<10} {:<6} {}",
                        job.id,
                        job.status.to_string(),
                        job.priority,
                        job.summary.join(",")
                    );
                }
                println!();
                println!("{} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: JobId,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome: CancelOutcome =
        send(http.post(format!("{}/api/jobs/{}/cancel", client.addr, job_id))).await?;
    match client.output {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Table => println!("{}", outcome.message),
    }
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_job_wait(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: JobId,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout);
    let mut prev_status: Option<JobStatus> = None;
    let mut prev_log_serial = 0;

    loop {
        let mut query = vec![
            ("prev_log_serial", prev_log_serial.to_string()),
            ("timeout_secs", WAIT_POLL_SECS.to_string()),
        ];
        if let Some(status) = prev_status {
            query.push(("prev_status", status.to_string()));
        }
        let change: JobChange = send(
            http.get(format!("{}/api/jobs/{}/wait", client.addr, job_id))
                .query(&query),
        )
        .await?;

        for entry in &change.log_entries {
            match client.output {
                OutputFormat::Json => print_json(entry)?,
                OutputFormat::Table => println!("{} {}", entry.timestamp, entry.message),
            }
            prev_log_serial = prev_log_serial.max(entry.serial);
        }
        if prev_status != Some(change.status) {
            if let OutputFormat::Table = client.output {
                println!("Job {} is {}", job_id, change.status);
            }
            prev_status = Some(change.status);
        }
        if change.status.is_finalized() {
            if change.status != JobStatus::Success {
                std::process::exit(1);
            }
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("Timed out waiting for job {}", job_id).into());
        }
    }
}

async fn handle_job_archive(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: JobId,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: ArchiveJobResponse =
        send(http.post(format!("{}/api/jobs/{}/archive", client.addr, job_id))).await?;
    match client.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if response.archived {
                println!("Job {} archived", job_id);
            } else {
                println!("Job {} is not finished, not archived", job_id);
            }
        }
    }
    Ok(())
}

fn print_queue_info(info: &QueueInfo, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => print_json(info)?,
        OutputFormat::Table => {
            println!("Queue Status");
            println!("{}", "=".repeat(40));
            println!("Drained:      {}", if info.drained { "yes" } else { "no" });
            println!("Job files:    {} / {}", info.queue_size, info.max_live_jobs);
            println!("Unfinished:   {}", info.live_jobs);
            println!("Ready:        {}", info.ready_jobs);
            println!("Last job ID:  {}", info.last_serial);
        }
    }
    Ok(())
}

async fn handle_queue_drain(
    http: &reqwest::Client,
    client: &ClientArgs,
    drain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let info: QueueInfo = send(
        http.put(format!("{}/api/queue/drain", client.addr))
            .json(&DrainRequest { drain }),
    )
    .await?;
    print_queue_info(&info, &client.output)
}

async fn handle_queue_archive(
    http: &reqwest::Client,
    client: &ClientArgs,
    age: Option<u64>,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = AutoArchiveRequest {
        age_secs: age,
        timeout_secs: Some(timeout),
    };
    let response: AutoArchiveResponse = send(
        http.post(format!("{}/api/queue/archive", client.addr))
            .json(&request),
    )
    .await?;
    match client.output {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            println!("Archived {} jobs", response.archived);
            if response.remaining > 0 {
                println!("{} jobs left unchecked (time budget exhausted)", response.remaining);
            }
        }
    }
    Ok(())
}

async fn handle_locks(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let locks: Vec<LockInfo> = send(http.get(format!("{}/api/locks", client.addr))).await?;
    match client.output {
        OutputFormat::Json => print_json(&locks)?,
        OutputFormat::Table => {
            if locks.is_empty() {
                println!("No locks held.");
                return Ok(());
            }
            println!("{:<32} {:<10} {:<16} PENDING", "NAME", "MODE", "OWNERS");
            println!("{}", "-".repeat(78));
            for lock in &locks {
                let mode = lock
                    .mode
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let owners = lock
                    .owners
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let pending = lock
                    .pending
                    .iter()
                    .map(|p| format!("{}:{}", p.job_id, p.mode))
                    .collect::<Vec<_>>()
                    .join(",");
                println!("{:<32} {:<10} {:<16} {}", lock.name, mode, owners, pending);
            }
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
    let http = reqwest::Client::new();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => match command {
            JobCommands::Submit { ops, priority } => {
                handle_job_submit(&http, &client, ops, priority).await?;
            }
            JobCommands::Status { job_id } => {
                handle_job_status(&http, &client, job_id).await?;
            }
            JobCommands::List { status, archived } => {
                handle_job_list(&http, &client, status, archived).await?;
            }
            JobCommands::Cancel { job_id } => {
                handle_job_cancel(&http, &client, job_id).await?;
            }
            JobCommands::Wait { job_id, timeout } => {
                handle_job_wait(&http, &client, job_id, timeout).await?;
            }
            JobCommands::Archive { job_id } => {
                handle_job_archive(&http, &client, job_id).await?;
            }
        },
        Commands::Queue { client, command } => match command {
            QueueCommands::Info => {
                let info: QueueInfo = send(http.get(format!("{}/api/queue", client.addr))).await?;
                print_queue_info(&info, &client.output)?;
            }
            QueueCommands::Drain => handle_queue_drain(&http, &client, true).await?,
            QueueCommands::Undrain => handle_queue_drain(&http, &client, false).await?,
            QueueCommands::Archive { age, timeout } => {
                handle_queue_archive(&http, &client, age, timeout).await?;
            }
        },
        Commands::Locks { client } => {
            handle_locks(&http, &client).await?;
        }
    }

    Ok(())
}
