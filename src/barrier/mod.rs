//! Rebalance barrier: gates startup until every consumer group owns its
//! full queue set.
//!
//! Messages sent before a group finishes rebalancing can be lost or
//! misrouted, so the process waits here before declaring itself ready. The
//! barrier polls the bus's reported assignments at a fixed interval and
//! releases waiters only when every tracked group's assigned-queue count
//! equals its expected partition count within the same poll iteration -
//! partial matches across different iterations do not count.
//!
//! State machine: `Starting -> Polling -> Ready`. The poll worker cancels
//! itself exactly once, on the transition to `Ready`.

use std::error::Error;
use std::fmt;
use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bus::QueueAssignments;

/// Barrier lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierState {
    /// Constructed, poll worker not yet running.
    Starting,
    /// Poll worker running, at least one group still short of its queues.
    Polling,
    /// All groups converged; waiters released.
    Ready,
}

/// Error from a bounded barrier wait.
#[derive(Debug)]
pub enum BarrierError {
    /// Rebalancing did not converge within the allowed wait.
    TimedOut { waited: Duration },
}

impl fmt::Display for BarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierError::TimedOut { waited } => write!(
                f,
                "consumer-group rebalancing did not converge within {:?}",
                waited
            ),
        }
    }
}

impl Error for BarrierError {}

/// Startup gate over consumer-group rebalancing.
///
/// ## Example
///
/// ```ignore
/// let mut barrier = RebalanceBarrier::new(bus.clone(), Duration::from_secs(1))
///     .track("command-consumer", 4)
///     .track("event-consumer", 4)
///     .track("completed-command-processor", 4);
/// barrier.start();
/// barrier.wait_timeout(Duration::from_secs(30))?;
/// ```
pub struct RebalanceBarrier {
    assignments: Arc<dyn QueueAssignments>,
    expectations: Vec<(String, usize)>,
    poll_interval: Duration,
    shared: Arc<(Mutex<BarrierState>, Condvar)>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<usize>>,
}

impl RebalanceBarrier {
    pub fn new(assignments: Arc<dyn QueueAssignments>, poll_interval: Duration) -> Self {
        Self {
            assignments,
            expectations: Vec::new(),
            poll_interval,
            shared: Arc::new((Mutex::new(BarrierState::Starting), Condvar::new())),
            stop: None,
            handle: None,
        }
    }

    /// Track a consumer group, expecting it to own `expected` queues.
    pub fn track(mut self, group: impl Into<String>, expected: usize) -> Self {
        self.expectations.push((group.into(), expected));
        self
    }

    /// Current barrier state.
    pub fn state(&self) -> BarrierState {
        *self.shared.0.lock().unwrap()
    }

    /// Start the poll worker. Idempotent.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        *self.shared.0.lock().unwrap() = BarrierState::Polling;

        let (stop_tx, stop_rx) = channel();
        let assignments = Arc::clone(&self.assignments);
        let expectations = self.expectations.clone();
        let interval = self.poll_interval;
        let shared = Arc::clone(&self.shared);

        let handle = thread::spawn(move || {
            let mut polls = 0usize;

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                polls += 1;

                // Every group is queried every iteration; all must match
                // within the same one.
                let mut converged = true;
                for (group, expected) in &expectations {
                    let owned = assignments.assigned_queues(group).len();
                    if owned != *expected {
                        debug!(group = %group, owned, expected, "group still rebalancing");
                        converged = false;
                    }
                }

                if converged {
                    let (state, condvar) = &*shared;
                    *state.lock().unwrap() = BarrierState::Ready;
                    condvar.notify_all();
                    info!(polls, "all consumer groups rebalanced, barrier ready");
                    break;
                }

                thread::sleep(interval);
            }

            polls
        });

        self.stop = Some(stop_tx);
        self.handle = Some(handle);
    }

    /// Block until the barrier is ready.
    ///
    /// This is the observed historical behavior: if rebalancing never
    /// converges, the call never returns. Prefer
    /// [`RebalanceBarrier::wait_timeout`].
    pub fn wait(&self) {
        let (state, condvar) = &*self.shared;
        let mut state = state.lock().unwrap();
        while *state != BarrierState::Ready {
            state = condvar.wait(state).unwrap();
        }
    }

    /// Block until the barrier is ready or `max_wait` elapses.
    pub fn wait_timeout(&self, max_wait: Duration) -> Result<(), BarrierError> {
        let started = Instant::now();
        let (state, condvar) = &*self.shared;
        let mut state = state.lock().unwrap();

        while *state != BarrierState::Ready {
            let waited = started.elapsed();
            let remaining = max_wait
                .checked_sub(waited)
                .ok_or(BarrierError::TimedOut { waited })?;
            let (next, result) = condvar.wait_timeout(state, remaining).unwrap();
            state = next;
            if result.timed_out() && *state != BarrierState::Ready {
                return Err(BarrierError::TimedOut {
                    waited: started.elapsed(),
                });
            }
        }
        Ok(())
    }

    /// Stop the poll worker (no-op once `Ready`, when the worker has
    /// already cancelled itself). Returns the number of polls performed.
    pub fn stop(&mut self) -> usize {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for RebalanceBarrier {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
