use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ReplayError, Result};

/// Header name to every value seen for it, in arrival order.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// One HTTP request as seen by the recorder.
///
/// `time` is the recorder's clock tick when the request was observed,
/// relative to the start of the recording session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedRequest {
    #[serde(rename = "Time")]
    pub time: u64,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "Header", default, deserialize_with = "null_as_default")]
    pub header: HeaderValues,
    #[serde(rename = "Body", default, deserialize_with = "null_as_default")]
    pub body: String,
}

impl CapturedRequest {
    pub fn new(time: u64, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            time,
            url: url.into(),
            method: method.into(),
            header: HeaderValues::new(),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.entry(name.into()).or_default().push(value.into());
        self
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Newline-delimited JSON log of captured requests.
///
/// Replay only ever calls [`RequestLog::load`]; [`RequestLog::append`] is the
/// recorder's side of the contract.
#[derive(Debug)]
pub struct RequestLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RequestLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record in the log. The first malformed line fails the
    /// whole load.
    pub fn load(&self) -> Result<Vec<CapturedRequest>> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ReplayError::Io {
            path: self.path.clone(),
            source,
        })?;

        let requests = parse_lines(&content)?;
        info!("Loaded {} captured requests from {:?}", requests.len(), self.path);
        Ok(requests)
    }

    /// Appends one record as a single line and syncs it to disk.
    pub fn append(&self, request: &CapturedRequest) -> Result<()> {
        let mut line = sonic_rs::to_string(request).map_err(ReplayError::Serialize)?;
        line.push('\n');

        let io_err = |source| ReplayError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o660);
        }

        let mut file = options.open(&self.path).map_err(io_err)?;
        // One write call per record keeps lines whole under O_APPEND.
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;

        debug!("Appended {} {} at tick {}", request.method, request.url, request.time);
        Ok(())
    }
}

fn parse_lines(content: &str) -> Result<Vec<CapturedRequest>> {
    let mut requests: Vec<CapturedRequest> = Vec::new();

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let request: CapturedRequest = sonic_rs::from_str(line).map_err(|source| {
            ReplayError::Parse {
                line: index + 1,
                source,
            }
        })?;

        if let Some(previous) = requests.last() {
            if request.time < previous.time {
                warn!(
                    "Line {} goes back in time (tick {} after tick {})",
                    index + 1,
                    request.time,
                    previous.time
                );
            }
        }

        requests.push(request);
    }

    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CapturedRequest {
        CapturedRequest::new(7, "POST", "http://example.com/login?next=%2Fhome")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_header("Accept", "text/html")
            .with_header("Accept", "application/xhtml+xml")
            .with_body("user=alice&pass=\"quoted\"\nsecond line")
    }

    #[test]
    fn append_then_load_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path().join("output.txt"));

        let first = CapturedRequest::new(0, "GET", "http://example.com/");
        let second = sample();
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[test]
    fn parses_recorder_format() {
        let line = r#"{"Time":12,"URL":"http://host/a","Method":"GET","Header":{"Accept":["*/*"]},"Body":""}"#;
        let parsed = parse_lines(line).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].time, 12);
        assert_eq!(parsed[0].url, "http://host/a");
        assert_eq!(parsed[0].header["Accept"], vec!["*/*".to_string()]);
    }

    #[test]
    fn null_header_and_missing_body_default_to_empty() {
        let line = r#"{"Time":0,"URL":"http://host/","Method":"GET","Header":null}"#;
        let parsed = parse_lines(line).unwrap();
        assert!(parsed[0].header.is_empty());
        assert!(parsed[0].body.is_empty());
    }

    #[test]
    fn malformed_line_fails_whole_load_with_line_number() {
        let content = concat!(
            r#"{"Time":0,"URL":"http://host/a","Method":"GET","Header":{},"Body":""}"#,
            "\n",
            "{not json\n",
            r#"{"Time":2,"URL":"http://host/c","Method":"GET","Header":{},"Body":""}"#,
            "\n",
        );
        match parse_lines(content) {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn negative_time_is_rejected() {
        let line = r#"{"Time":-1,"URL":"http://host/","Method":"GET","Header":{},"Body":""}"#;
        assert!(matches!(parse_lines(line), Err(ReplayError::Parse { line: 1, .. })));
    }

    #[test]
    fn out_of_order_records_are_kept_in_file_order() {
        let content = concat!(
            r#"{"Time":5,"URL":"http://host/a","Method":"GET","Header":{},"Body":""}"#,
            "\n\n",
            r#"{"Time":1,"URL":"http://host/b","Method":"GET","Header":{},"Body":""}"#,
            "\n",
        );
        let parsed = parse_lines(content).unwrap();
        let urls: Vec<_> = parsed.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, ["http://host/a", "http://host/b"]);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = RequestLog::new(dir.path().join("absent.txt"));
        assert!(matches!(log.load(), Err(ReplayError::Io { .. })));
    }

    #[test]
    fn concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(RequestLog::new(dir.path().join("output.txt")));

        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let log = std::sync::Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let body = "x".repeat(512);
                        let request = CapturedRequest::new(i, "PUT", format!("http://host/{writer}/{i}"))
                            .with_body(body);
                        log.append(&request).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 100);
        assert!(loaded.iter().all(|r| r.body.len() == 512));
    }
}
