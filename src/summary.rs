use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::info;

use crate::client::{ClientResult, RequestResult};

/// Aggregation key for results: status code, method and URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    pub status_code: Option<u16>,
    pub method: String,
    pub url: String,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} {} {}", code, self.method, self.url),
            None => write!(f, "ERR {} {}", self.method, self.url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSummary {
    pub signature: Signature,
    pub fastest: Duration,
    pub slowest: Duration,
}

/// Fastest and slowest response time per signature across a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    /// Sorted by signature.
    pub groups: Vec<SignatureSummary>,
}

/// Every request result of the run, client by client, in dispatch order.
pub fn flatten(clients: &[ClientResult]) -> impl Iterator<Item = &RequestResult> {
    clients.iter().flat_map(|client| client.results.iter())
}

pub fn summarize(clients: &[ClientResult]) -> Summary {
    let mut groups: BTreeMap<Signature, (Duration, Duration)> = BTreeMap::new();

    for result in flatten(clients) {
        let time = result.response_time;
        groups
            .entry(result.signature())
            .and_modify(|(fastest, slowest)| {
                *fastest = (*fastest).min(time);
                *slowest = (*slowest).max(time);
            })
            .or_insert((time, time));
    }

    Summary {
        groups: groups
            .into_iter()
            .map(|(signature, (fastest, slowest))| SignatureSummary {
                signature,
                fastest,
                slowest,
            })
            .collect(),
    }
}

impl Summary {
    pub fn get(&self, signature: &Signature) -> Option<&SignatureSummary> {
        self.groups.iter().find(|group| &group.signature == signature)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn log(&self) {
        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║                      REPLAY SUMMARY                        ║");
        info!("╚════════════════════════════════════════════════════════════╝");

        if self.groups.is_empty() {
            info!("  No data");
        }
        for group in &self.groups {
            info!("");
            info!("{}", group.signature);
            info!("  fastest: {:?}", group.fastest);
            info!("  slowest: {:?}", group.slowest);
        }

        info!("");
        info!("═══════════════════════════════════════════════════════════");
    }
}
