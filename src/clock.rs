use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::debug;

use crate::config::TICK;

// =============================================================================
// Clock
// =============================================================================

/// Discrete time source used to line up replay with capture offsets.
///
/// A clock goes `Stopped -> Running -> Stopped` exactly once. `start` on a
/// running clock does nothing and a stopped clock never runs again.
pub trait Clock: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn current(&self) -> u64;
    fn is_running(&self) -> bool;
    /// Receiver that observes every tick change.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Hands out one fresh clock per virtual client.
pub trait ClockSource: Send + Sync {
    fn create(&self) -> Arc<dyn Clock>;
}

/// Suspends until `clock` reaches `tick`. Returns `false` if the clock went
/// away before that happened.
pub async fn wait_for_tick(clock: &dyn Clock, tick: u64) -> bool {
    if clock.current() >= tick {
        return true;
    }
    let mut ticks = clock.subscribe();
    let reached = ticks.wait_for(|current| *current >= tick).await.is_ok();
    reached
}

#[derive(Debug)]
struct ClockState {
    tick: watch::Sender<u64>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl ClockState {
    fn new() -> Self {
        let (tick, _) = watch::channel(0);
        Self {
            tick,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Flips to running. `false` if already running or stopped for good.
    fn begin(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        !self.running.swap(true, Ordering::AcqRel)
    }

    fn end(&self) {
        self.stopped.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    fn current(&self) -> u64 {
        *self.tick.borrow()
    }
}

// =============================================================================
// Timer-driven clock
// =============================================================================

/// Clock advanced by a background tokio task once per quantum.
///
/// Must be started from inside a tokio runtime.
#[derive(Debug)]
pub struct TickClock {
    quantum: Duration,
    state: Arc<ClockState>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TickClock {
    pub fn new() -> Self {
        Self::with_quantum(TICK)
    }

    pub fn with_quantum(quantum: Duration) -> Self {
        Self {
            quantum,
            state: Arc::new(ClockState::new()),
            ticker: Mutex::new(None),
        }
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TickClock {
    fn start(&self) {
        if !self.state.begin() {
            return;
        }

        let state = Arc::clone(&self.state);
        let quantum = self.quantum;
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + quantum, quantum);
            loop {
                interval.tick().await;
                if !state.running.load(Ordering::Acquire) {
                    break;
                }
                state.tick.send_modify(|tick| *tick += 1);
            }
        });

        *self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    fn stop(&self) {
        self.state.end();
        if let Some(handle) = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    fn current(&self) -> u64 {
        self.state.current()
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.tick.subscribe()
    }
}

impl Drop for TickClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone)]
pub struct TickClockSource {
    quantum: Duration,
}

impl TickClockSource {
    pub fn new(quantum: Duration) -> Self {
        Self { quantum }
    }
}

impl Default for TickClockSource {
    fn default() -> Self {
        Self::new(TICK)
    }
}

impl ClockSource for TickClockSource {
    fn create(&self) -> Arc<dyn Clock> {
        Arc::new(TickClock::with_quantum(self.quantum))
    }
}

// =============================================================================
// Manually advanced clock
// =============================================================================

/// Clock that only moves when [`ManualClock::advance`] is called. Clones
/// share the same underlying clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<ClockState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ClockState::new()),
        }
    }

    /// Moves the clock forward by `ticks` if it is running and returns the
    /// resulting tick.
    pub fn advance(&self, ticks: u64) -> u64 {
        if self.state.running.load(Ordering::Acquire) {
            self.state.tick.send_modify(|tick| *tick += ticks);
        }
        self.state.current()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn start(&self) {
        self.state.begin();
    }

    fn stop(&self) {
        self.state.end();
    }

    fn current(&self) -> u64 {
        self.state.current()
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.state.tick.subscribe()
    }
}

/// Creates [`ManualClock`]s and keeps a handle to each so tests can drive
/// every client's clock.
#[derive(Debug, Default)]
pub struct ManualClockSource {
    clocks: Mutex<Vec<ManualClock>>,
}

impl ManualClockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clocks(&self) -> Vec<ManualClock> {
        self.clocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Advances every clock created so far.
    pub fn advance_all(&self, ticks: u64) {
        for clock in self.clocks() {
            clock.advance(ticks);
        }
        debug!("Advanced all manual clocks by {} ticks", ticks);
    }
}

impl ClockSource for ManualClockSource {
    fn create(&self) -> Arc<dyn Clock> {
        let clock = ManualClock::new();
        self.clocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(clock.clone());
        Arc::new(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn tick_clock_counts_quanta_while_running() {
        let clock = TickClock::new();
        assert_eq!(clock.current(), 0);
        assert!(!clock.is_running());

        clock.start();
        assert!(clock.is_running());
        sleep(Duration::from_millis(350)).await;
        assert_eq!(clock.current(), 3);

        clock.stop();
        assert!(!clock.is_running());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(clock.current(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let clock = TickClock::new();
        clock.start();
        clock.start();
        sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.current(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_terminal() {
        let clock = TickClock::new();
        clock.start();
        sleep(Duration::from_millis(150)).await;
        clock.stop();
        clock.start();
        assert!(!clock.is_running());
        sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.current(), 1);
    }

    #[test]
    fn manual_clock_only_moves_while_running() {
        let clock = ManualClock::new();
        assert_eq!(clock.advance(5), 0);

        clock.start();
        assert_eq!(clock.advance(5), 5);
        assert_eq!(clock.advance(2), 7);

        clock.stop();
        assert_eq!(clock.advance(10), 7);
        clock.start();
        assert!(!clock.is_running());
    }

    #[tokio::test]
    async fn wait_for_tick_blocks_until_due() {
        let clock = ManualClock::new();
        clock.start();

        let waiter = {
            let clock = clock.clone();
            tokio::spawn(async move { wait_for_tick(&clock, 3).await })
        };

        clock.advance(2);
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        clock.advance(1);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_past_tick_returns_immediately() {
        let clock = ManualClock::new();
        clock.start();
        clock.advance(10);
        assert!(wait_for_tick(&clock, 4).await);
        assert!(wait_for_tick(&clock, 0).await);
    }

    #[test]
    fn manual_source_tracks_independent_clocks() {
        let source = ManualClockSource::new();
        let first = source.create();
        let second = source.create();
        first.start();

        source.advance_all(3);
        assert_eq!(first.current(), 3);
        // Not started, so it does not move.
        assert_eq!(second.current(), 0);
        assert_eq!(source.clocks().len(), 2);
    }
}
