use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use replay_bench::{run_load_test, LoadTestConfig, OutputOptions, RequestLog};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "replay-bench")]
#[command(about = "Replay captured HTTP traffic as load", long_about = None)]
struct Cli {
    /// Captured request log (one JSON record per line)
    #[arg(long, env = "REPLAY_LOG_FILE", default_value = "output.txt")]
    log_file: PathBuf,

    /// Number of clients kept active during the test
    #[arg(long, env = "MAXIMUM_CLIENTS", default_value = "10")]
    maximum_clients: usize,

    /// Test duration in seconds
    #[arg(long, env = "DURATION", default_value = "300")]
    duration: f64,

    /// Write the response headers of every request
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    write_response_headers: bool,

    /// Write the response body of every request
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    write_response_body: bool,

    /// Write the response time of every request
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    write_response_time: bool,

    /// Print fastest/slowest per request at the end
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    summary: bool,

    /// Per-request timeout in milliseconds (none by default)
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Resend captured request headers
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    replay_headers: bool,
}

impl Cli {
    fn load_test_config(&self) -> Result<LoadTestConfig> {
        let duration = Duration::try_from_secs_f64(self.duration)
            .with_context(|| format!("Invalid duration: {}", self.duration))?;

        Ok(LoadTestConfig::new(self.maximum_clients, duration)
            .with_output(OutputOptions {
                response_headers: self.write_response_headers,
                response_body: self.write_response_body,
                response_time: self.write_response_time,
                summary: self.summary,
            })
            .with_request_timeout(self.request_timeout_ms.map(Duration::from_millis))
            .with_replay_headers(self.replay_headers))
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_test_config()?;

    info!("════════════════════════════════════════════════════════════");
    info!("                HTTP TRAFFIC REPLAY");
    info!("════════════════════════════════════════════════════════════");
    info!("Request log: {:?}", cli.log_file);
    info!("Clients: {}", config.concurrency);
    info!("Duration: {:?}", config.duration);
    if let Some(timeout) = config.request_timeout {
        info!("Request timeout: {:?}", timeout);
    }
    info!("════════════════════════════════════════════════════════════");

    let log = RequestLog::new(&cli.log_file);
    let report = run_load_test(&log, config)
        .await
        .with_context(|| format!("Load test on {:?} failed", cli.log_file))?;

    info!("Clients completed: {}", report.client_results.len());
    info!("Peak active clients: {}", report.peak_active_clients);
    info!("Elapsed: {:?}", report.elapsed);
    info!("════════════════════════════════════════════════════════════");
    info!("                  REPLAY COMPLETE");
    info!("════════════════════════════════════════════════════════════");

    Ok(())
}
