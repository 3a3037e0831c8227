use std::fmt;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

/// Shortest timer period a trigger will run with.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Where a worker is in its accumulate/flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Accumulating,
    Flushing,
}

/// What made a worker flush. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Volume,
    Timer,
    Signal,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlushReason::Volume => "volume",
            FlushReason::Timer => "timer",
            FlushReason::Signal => "signal",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Per-worker flush decision: a record-count threshold plus a periodic timer
/// that bounds how long a quiet worker holds data.
///
/// Each worker owns one, so there is no cross-worker coordination.
pub struct FlushTrigger {
    threshold: usize,
    interval: Interval,
    state: WorkerState,
}

impl FlushTrigger {
    /// `period` is raised to [`MIN_FLUSH_INTERVAL`] if shorter.
    pub fn new(threshold: usize, period: Duration) -> Self {
        let period = period.max(MIN_FLUSH_INTERVAL);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            threshold,
            interval,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Await the next timer tick.
    pub async fn next_tick(&mut self) {
        self.interval.tick().await;
    }

    /// A job was dequeued into the local accumulation.
    pub fn record_dequeue(&mut self) {
        if self.state == WorkerState::Idle {
            self.state = WorkerState::Accumulating;
        }
    }

    /// Whether `pending` locally held records cross the volume threshold.
    pub fn should_flush_on_volume(&self, pending: usize) -> bool {
        self.state == WorkerState::Accumulating && pending > self.threshold
    }

    /// Whether a timer tick should flush. Idle workers have nothing to send.
    pub fn should_flush_on_timer(&self) -> bool {
        self.state == WorkerState::Accumulating
    }

    /// Enter `Flushing`. Returns `false` when there is nothing accumulated.
    pub fn begin_flush(&mut self) -> bool {
        if self.state != WorkerState::Accumulating {
            return false;
        }
        self.state = WorkerState::Flushing;
        true
    }

    /// The POST attempt resolved. Restarts the timer from now.
    pub fn record_flush(&mut self) {
        self.state = WorkerState::Idle;
        self.interval.reset();
    }
}
