//! tally-server CLI - TCP ingest server with exact deduplication.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tally_server::{Server, ServerConfig, ShutdownSummary, DEFAULT_MAX_CLIENTS, DEFAULT_PORT};
use tracing_subscriber::EnvFilter;

/// TCP ingest server that deduplicates 9-digit records.
///
/// Clients send one 9-digit number per line. Each distinct number is written
/// once to the output file. Sending `terminate` shuts the server down.
///
/// Run with no positional arguments for the defaults, or give both PORT and
/// MAX_CLIENTS.
#[derive(Parser, Debug)]
#[command(name = "tally-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port to listen on [default: 4000].
    #[arg(value_name = "PORT", requires = "max_clients")]
    port: Option<u16>,

    /// Maximum number of concurrently connected clients [default: 5].
    #[arg(value_name = "MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Output file for unique records.
    #[arg(short, long, default_value = "numbers.log")]
    output: PathBuf,

    /// Seconds between stats reports.
    #[arg(long, default_value = "10")]
    report_interval_secs: u64,

    /// Seconds to wait for tasks after a cooperative stop.
    #[arg(long, default_value = "30")]
    shutdown_grace_secs: u64,

    /// Seconds to wait for tasks after a forceful interrupt.
    #[arg(long, default_value = "30")]
    shutdown_force_secs: u64,

    /// Drop a record after this many failed writes (retries forever if unset).
    #[arg(long)]
    max_write_retries: Option<u32>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Print the shutdown summary as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::new()
            .with_host(self.host)
            .with_port(self.port.unwrap_or(DEFAULT_PORT))
            .with_max_clients(self.max_clients.unwrap_or(DEFAULT_MAX_CLIENTS))
            .with_output_path(self.output)
            .with_report_interval(Duration::from_secs(self.report_interval_secs))
            .with_shutdown_timeouts(
                Duration::from_secs(self.shutdown_grace_secs),
                Duration::from_secs(self.shutdown_force_secs),
            );
        if let Some(retries) = self.max_write_retries {
            config = config.with_max_write_retries(retries);
        }
        config
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(summary: &ShutdownSummary) {
    eprintln!();
    eprintln!("Shutdown Summary:");
    eprintln!("  Outcome:              {:?}", summary.outcome);
    eprintln!("  Connections accepted: {}", summary.connections_accepted);
    eprintln!("  Protocol violations:  {}", summary.protocol_violations);
    eprintln!("  Unique records:       {}", summary.unique_total);
    eprintln!("  Write failures:       {}", summary.write_failures);
    if summary.dropped_records > 0 {
        eprintln!("  Dropped records:      {}", summary.dropped_records);
    }
    if summary.abandoned_records > 0 {
        eprintln!("  Abandoned records:    {}", summary.abandoned_records);
    }
    eprintln!("  Uptime:               {:.3}s", summary.elapsed_secs);
}

async fn serve(config: ServerConfig) -> tally_server::Result<ShutdownSummary> {
    let server = Server::bind(config).await?;
    server.run().await
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;
    let config = cli.into_config();

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .thread_name("tally-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(serve(config));
    runtime.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(summary) => {
            if json {
                match serde_json::to_string_pretty(&summary) {
                    Ok(out) => println!("{out}"),
                    Err(e) => {
                        eprintln!("Error: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print_summary(&summary);
            }
            if summary.outcome.is_terminated() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
