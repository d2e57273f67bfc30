use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::client::{ClientResult, VirtualClient};
use crate::clock::{ClockSource, TickClockSource};
use crate::config::{LoadTestConfig, OutputOptions};
use crate::error::Result;
use crate::log_store::{CapturedRequest, RequestLog};
use crate::summary::{summarize, Summary};

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone)]
pub struct LoadTestReport {
    /// In completion order.
    pub client_results: Vec<ClientResult>,
    pub summary: Summary,
    pub clients_spawned: usize,
    pub peak_active_clients: usize,
    pub elapsed: Duration,
}

// =============================================================================
// Active client accounting
// =============================================================================

/// Counts in-flight clients. `close` marks the replacement window as over;
/// after that the first time the count is zero completion is reported, and
/// it is reported only once.
#[derive(Debug, Default)]
struct ActiveClients {
    active: usize,
    peak: usize,
    spawned: usize,
    closed: bool,
    completed: bool,
}

impl ActiveClients {
    fn spawned(&mut self) -> usize {
        self.active += 1;
        self.spawned += 1;
        self.peak = self.peak.max(self.active);
        self.spawned
    }

    fn finished(&mut self) -> bool {
        self.active = self.active.saturating_sub(1);
        self.check_completion()
    }

    fn close(&mut self) -> bool {
        self.closed = true;
        self.check_completion()
    }

    fn check_completion(&mut self) -> bool {
        if self.closed && self.active == 0 && !self.completed {
            self.completed = true;
            return true;
        }
        false
    }
}

// =============================================================================
// Load Controller
// =============================================================================

/// Holds `concurrency` virtual clients busy until `duration` has elapsed,
/// replacing each one as it finishes, then waits for the last wave.
pub struct LoadController {
    config: Arc<LoadTestConfig>,
    clocks: Arc<dyn ClockSource>,
}

impl LoadController {
    pub fn new(config: LoadTestConfig) -> Self {
        Self {
            config: Arc::new(config),
            clocks: Arc::new(TickClockSource::default()),
        }
    }

    pub fn with_clock_source(mut self, clocks: Arc<dyn ClockSource>) -> Self {
        self.clocks = clocks;
        self
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    pub async fn run(&self, requests: Vec<CapturedRequest>) -> Result<LoadTestReport> {
        let requests: Arc<[CapturedRequest]> = requests.into();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<ClientResult>();
        let mut clients = JoinSet::new();
        let mut active = ActiveClients::default();
        let started = Instant::now();

        info!(
            "Starting replay of {} requests with {} clients for {:?}",
            requests.len(),
            self.config.concurrency,
            self.config.duration
        );

        for _ in 0..self.config.concurrency {
            self.spawn_client(&mut clients, &mut active, &requests, &results_tx, started)?;
        }

        let mut client_results = Vec::new();
        let mut done = active.active == 0 && active.close();

        while !done {
            tokio::select! {
                biased;

                Some(result) = results_rx.recv() => {
                    let finished = active.finished();
                    log_client_result(&result, &self.config.output, active.active);
                    client_results.push(result);
                    done = finished || self.replenish(&mut clients, &mut active, &requests, &results_tx, started)?;
                }

                Some(joined) = clients.join_next(), if !clients.is_empty() => {
                    // A client that finished normally already sent its result.
                    if let Err(e) = joined {
                        error!("Client task died without a result: {}", e);
                        let finished = active.finished();
                        done = finished || self.replenish(&mut clients, &mut active, &requests, &results_tx, started)?;
                    }
                }

                else => break,
            }
        }

        let elapsed = started.elapsed();
        info!(
            "Replay finished: {} clients in {:?} (peak {} active)",
            active.spawned, elapsed, active.peak
        );

        Ok(LoadTestReport {
            summary: summarize(&client_results),
            client_results,
            clients_spawned: active.spawned,
            peak_active_clients: active.peak,
            elapsed,
        })
    }

    /// Spawns a replacement while the test window is open, otherwise closes
    /// the window. Returns `true` once the last client is done.
    fn replenish(
        &self,
        clients: &mut JoinSet<()>,
        active: &mut ActiveClients,
        requests: &Arc<[CapturedRequest]>,
        results_tx: &mpsc::UnboundedSender<ClientResult>,
        started: Instant,
    ) -> Result<bool> {
        if started.elapsed() < self.config.duration && !active.closed {
            self.spawn_client(clients, active, requests, results_tx, started)?;
            return Ok(false);
        }

        let done = active.close();
        if !done {
            info!("Waiting for {} clients to complete...", active.active);
        }
        Ok(done)
    }

    fn spawn_client(
        &self,
        clients: &mut JoinSet<()>,
        active: &mut ActiveClients,
        requests: &Arc<[CapturedRequest]>,
        results_tx: &mpsc::UnboundedSender<ClientResult>,
        started: Instant,
    ) -> Result<()> {
        let number = active.spawned + 1;
        let client = VirtualClient::new(
            number,
            started.elapsed(),
            self.clocks.create(),
            &self.config,
        )?;
        active.spawned();

        let requests = Arc::clone(requests);
        let results_tx = results_tx.clone();
        clients.spawn(async move {
            let result = client.run(&requests).await;
            if results_tx.send(result).is_err() {
                warn!("Controller gone, dropping result of client {}", number);
            }
        });
        Ok(())
    }
}

fn log_client_result(result: &ClientResult, output: &OutputOptions, active: usize) {
    info!("Client #{}", result.client_number);
    for request in &result.results {
        info!("{}", request.signature());
        if let Some(error) = &request.error {
            warn!("Error during request: {}", error);
        }
        if output.response_headers {
            info!("{}", request.format_response_head());
        }
        if output.response_body {
            info!("{}", request.response_body);
        }
        if output.response_time {
            info!("response time: {:?}", request.response_time);
        }
    }
    info!("Current clients: {}", active);
}

/// Loads the captured log and replays it under `config`. The log is read in
/// full before any client starts.
pub async fn run_load_test(log: &RequestLog, config: LoadTestConfig) -> Result<LoadTestReport> {
    let requests = log.load()?;
    let show_summary = config.output.summary;

    let report = LoadController::new(config).run(requests).await?;
    if show_summary {
        report.summary.log();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_fires_once() {
        let mut active = ActiveClients::default();
        active.spawned();
        active.spawned();
        assert_eq!(active.peak, 2);

        assert!(!active.finished());
        assert!(!active.close());
        assert!(active.finished());
        // Count is still zero, but completion was already reported.
        assert!(!active.finished());
        assert!(!active.close());
    }

    #[test]
    fn zero_before_close_is_not_completion() {
        let mut active = ActiveClients::default();
        active.spawned();
        assert!(!active.finished());
        assert!(active.close());
    }

    #[tokio::test]
    async fn zero_concurrency_finishes_immediately() {
        let controller = LoadController::new(LoadTestConfig::new(0, Duration::from_secs(60)));
        let report = controller
            .run(vec![CapturedRequest::new(0, "GET", "http://127.0.0.1:9/")])
            .await
            .unwrap();

        assert!(report.client_results.is_empty());
        assert_eq!(report.clients_spawned, 0);
        assert!(report.summary.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_clients_until_cutoff_then_drains() {
        let duration = Duration::from_millis(100);
        let controller = LoadController::new(LoadTestConfig::new(2, duration))
            .with_clock_source(Arc::new(TickClockSource::new(Duration::from_millis(10))));

        // Each client waits one tick, then fails without touching the network.
        let report = controller
            .run(vec![CapturedRequest::new(1, "GET", "not a url")])
            .await
            .unwrap();

        assert!(report.clients_spawned > 2);
        assert_eq!(report.client_results.len(), report.clients_spawned);
        assert!(report.peak_active_clients <= 2);
        assert!(report.elapsed >= duration);

        let mut numbers: Vec<_> = report.client_results.iter().map(|c| c.client_number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=report.clients_spawned).collect::<Vec<_>>());

        for client in &report.client_results {
            assert!(client.spawned_at < duration);
            assert_eq!(client.results.len(), 1);
            assert!(client.failed());
        }
    }

    #[tokio::test]
    async fn run_load_test_rejects_corrupt_log_before_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        std::fs::write(&path, "{\"Time\":0}\ngarbage\n").unwrap();

        let result = run_load_test(&RequestLog::new(path), LoadTestConfig::new(1, Duration::from_secs(1))).await;
        assert!(matches!(result, Err(crate::ReplayError::Parse { line: 1, .. })));
    }
}
