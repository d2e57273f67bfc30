//! Replays captured HTTP traffic against a target as closed-loop load.
//!
//! A [`RequestLog`] holds the captured requests. The [`LoadController`] keeps
//! a fixed number of [`VirtualClient`]s replaying that log, each on its own
//! virtual [`Clock`] and cookie jar, and folds their results into a
//! per-signature [`Summary`].

pub mod client;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod log_store;
pub mod recorder;
pub mod summary;

pub use client::{ClientResult, RequestResult, VirtualClient};
pub use clock::{Clock, ClockSource, ManualClock, ManualClockSource, TickClock, TickClockSource};
pub use config::{LoadTestConfig, OutputOptions, TICK};
pub use controller::{run_load_test, LoadController, LoadTestReport};
pub use error::{ReplayError, Result};
pub use log_store::{CapturedRequest, HeaderValues, RequestLog};
pub use recorder::Recorder;
pub use summary::{summarize, Signature, SignatureSummary, Summary};
