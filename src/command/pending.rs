//! Registry of in-flight commands awaiting a result.
//!
//! This map is the only state touched by more than one actor: the send path
//! inserts, the completed-command processor resolves, and the timeout sweep
//! expires. All three go through one mutex, and an entry leaves the map in
//! the same critical section that fulfills its handle - so a command can
//! never be resolved twice.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::{CommandOutcome, SendError};

struct PendingEntry {
    completion: Sender<CommandOutcome>,
    sent_at: Instant,
    deadline: Instant,
}

/// Shared registry of pending commands.
///
/// Cheap to clone; all handles share the same map. The `CommandService`
/// owns the send path, the completed-command processor calls
/// [`PendingCommands::resolve`], and the service's sweep worker calls
/// [`PendingCommands::sweep`].
#[derive(Clone)]
pub struct PendingCommands {
    inner: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCommands {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a command and hand back the caller's completion handle.
    ///
    /// Fails with `DuplicateId` if a command with this id is still pending;
    /// replacing the live entry would orphan the first caller's handle.
    pub fn register(
        &self,
        command_id: &str,
        timeout: Duration,
    ) -> Result<CommandHandle, SendError> {
        let (tx, rx) = channel();
        let now = Instant::now();

        let mut pending = self.inner.lock().unwrap();
        if pending.contains_key(command_id) {
            return Err(SendError::DuplicateId(command_id.to_string()));
        }
        pending.insert(
            command_id.to_string(),
            PendingEntry {
                completion: tx,
                sent_at: now,
                deadline: now + timeout,
            },
        );

        Ok(CommandHandle {
            command_id: command_id.to_string(),
            receiver: rx,
        })
    }

    /// Remove an entry without fulfilling it (rollback after a failed
    /// publish). The caller's handle reports `None` afterwards.
    pub fn discard(&self, command_id: &str) {
        self.inner.lock().unwrap().remove(command_id);
    }

    /// Resolve a pending command with its final outcome.
    ///
    /// Returns `true` if a live entry was fulfilled. An absent id means the
    /// resolution is stale or a duplicate and is silently ignored - this is
    /// what makes at-least-once result delivery safe.
    pub fn resolve(&self, command_id: &str, outcome: CommandOutcome) -> bool {
        let entry = self.inner.lock().unwrap().remove(command_id);
        match entry {
            Some(entry) => {
                // A dropped handle is not an error; the command still
                // counts as resolved.
                let _ = entry.completion.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Expire every entry past its deadline, fulfilling each with
    /// `TimedOut`. Returns the number of commands expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut pending = self.inner.lock().unwrap();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                warn!(
                    command_id = %id,
                    pending_for_ms = entry.sent_at.elapsed().as_millis() as u64,
                    "command timed out without a result event"
                );
                let _ = entry.completion.send(CommandOutcome::TimedOut);
            }
        }
        expired.len()
    }

    /// Whether a command id is still pending.
    pub fn contains(&self, command_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(command_id)
    }

    /// Number of commands currently pending.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// The caller's handle on a sent command.
///
/// Fulfilled exactly once - by a correlated result event or by the timeout
/// sweep. All waiting methods return `None` if the registry was torn down
/// before the command resolved (service shutdown).
pub struct CommandHandle {
    command_id: String,
    receiver: Receiver<CommandOutcome>,
}

impl CommandHandle {
    /// The id of the command this handle tracks.
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Block until the command resolves.
    pub fn wait(&self) -> Option<CommandOutcome> {
        self.receiver.recv().ok()
    }

    /// Block until the command resolves or `timeout` elapses.
    ///
    /// `None` on timeout does not mean the command failed - the sweep will
    /// still resolve it eventually.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CommandOutcome> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Check for a resolution without blocking.
    pub fn try_outcome(&self) -> Option<CommandOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
