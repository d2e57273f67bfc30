use std::sync::Arc;

use tracing::info;
use url::Url;

use crate::clock::Clock;
use crate::error::{ReplayError, Result};
use crate::log_store::{CapturedRequest, HeaderValues, RequestLog};

/// Capture-side bookkeeping for an intercepting proxy.
///
/// The proxy hands every request it sees to [`Recorder::record`]; requests
/// whose host passes the whitelist are stamped with the recorder clock's
/// current tick and appended to the log. The clock starts with the first
/// recorded request, so the session's first request lands near tick 0.
pub struct Recorder {
    log: RequestLog,
    clock: Arc<dyn Clock>,
    whitelist: Vec<String>,
}

impl Recorder {
    pub fn new(log: RequestLog, clock: Arc<dyn Clock>) -> Self {
        Self {
            log,
            clock,
            whitelist: Vec::new(),
        }
    }

    /// Comma separated host fragments. Empty entries are ignored and an
    /// empty whitelist records everything.
    pub fn with_whitelist(mut self, hosts: &str) -> Self {
        self.whitelist = hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    pub fn should_record(&self, url: &str) -> Result<bool> {
        if self.whitelist.is_empty() {
            return Ok(true);
        }
        let parsed = Url::parse(url).map_err(|e| ReplayError::InvalidUrl(format!("{url}: {e}")))?;
        let host = parsed.host_str().unwrap_or("");
        Ok(self.whitelist.iter().any(|allowed| host.contains(allowed.as_str())))
    }

    /// Appends the request if it should be recorded. An append failure is
    /// returned as is; losing captured traffic silently is not an option.
    pub fn record(
        &self,
        method: &str,
        url: &str,
        header: HeaderValues,
        body: String,
    ) -> Result<Option<CapturedRequest>> {
        if !self.should_record(url)? {
            return Ok(None);
        }

        self.clock.start();
        let request = CapturedRequest {
            time: self.clock.current(),
            url: url.to_string(),
            method: method.to_string(),
            header,
            body,
        };
        self.log.append(&request)?;
        info!("{} {}", request.method, request.url);

        Ok(Some(request))
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.clock.stop();
    }
}
