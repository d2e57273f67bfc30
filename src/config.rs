use std::time::Duration;

/// Length of one virtual clock tick. Captured request offsets are expressed
/// in multiples of this.
pub const TICK: Duration = Duration::from_millis(100);

/// Which parts of each result get written to the log as clients finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    pub response_headers: bool,
    pub response_body: bool,
    pub response_time: bool,
    pub summary: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            response_headers: false,
            response_body: false,
            response_time: true,
            summary: true,
        }
    }
}

/// Immutable settings for one load test run. Built once by the caller and
/// shared with the controller and every virtual client.
#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    /// Number of virtual clients held active until `duration` has elapsed.
    pub concurrency: usize,
    /// Wall-clock window during which finished clients are replaced.
    pub duration: Duration,
    pub output: OutputOptions,
    /// Per-request timeout handed to each session's HTTP client.
    pub request_timeout: Option<Duration>,
    /// Resend captured request headers (minus transport-managed ones).
    pub replay_headers: bool,
}

impl LoadTestConfig {
    pub fn new(concurrency: usize, duration: Duration) -> Self {
        Self {
            concurrency,
            duration,
            output: OutputOptions::default(),
            request_timeout: None,
            replay_headers: false,
        }
    }

    pub fn with_output(mut self, output: OutputOptions) -> Self {
        self.output = output;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_replay_headers(mut self, replay_headers: bool) -> Self {
        self.replay_headers = replay_headers;
        self
    }
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(300))
    }
}
