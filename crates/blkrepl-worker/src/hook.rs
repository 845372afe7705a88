//! Notification hook collaborator: named events handed to an external handler.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Events the worker reports to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperEvent {
    /// About to become sync target.
    BeforeResyncTarget,
    /// About to become sync source.
    BeforeResyncSource,
    /// Finished a resync as target.
    AfterResyncTarget,
    /// Online verify found out-of-sync blocks.
    OutOfSync,
    /// Local I/O error under the `call_helper` policy.
    LocalIoError,
}

impl HelperEvent {
    /// Handler argument for this event.
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperEvent::BeforeResyncTarget => "before-resync-target",
            HelperEvent::BeforeResyncSource => "before-resync-source",
            HelperEvent::AfterResyncTarget => "after-resync-target",
            HelperEvent::OutOfSync => "out-of-sync",
            HelperEvent::LocalIoError => "local-io-error",
        }
    }
}

/// Runs the external handler for an event and returns its exit status.
pub trait NotificationHook: Send + Sync {
    /// Invoke the handler for `event` on device `minor`.
    fn call(&self, minor: u32, event: HelperEvent) -> i32;
}

/// Hook that records every call (tests and the simulator).
#[derive(Debug, Default)]
pub struct RecordingHook {
    calls: Mutex<Vec<(u32, HelperEvent)>>,
    results: Mutex<HashMap<HelperEvent, i32>>,
}

impl RecordingHook {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<(u32, HelperEvent)> {
        self.calls.lock().clone()
    }

    /// Number of calls for `event`.
    pub fn count(&self, event: HelperEvent) -> usize {
        self.calls.lock().iter().filter(|(_, e)| *e == event).count()
    }

    /// Make calls for `event` return `code` (default 0).
    pub fn set_result(&self, event: HelperEvent, code: i32) {
        self.results.lock().insert(event, code);
    }
}

impl NotificationHook for RecordingHook {
    fn call(&self, minor: u32, event: HelperEvent) -> i32 {
        info!("minor {}: helper {}", minor, event.as_str());
        self.calls.lock().push((minor, event));
        self.results.lock().get(&event).copied().unwrap_or(0)
    }
}

/// Hook that runs an external program with the event name as its argument
/// and the minor in `BLKREPL_MINOR`.
#[derive(Debug, Clone)]
pub struct CommandHook {
    program: PathBuf,
}

impl CommandHook {
    /// Create a hook running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl NotificationHook for CommandHook {
    fn call(&self, minor: u32, event: HelperEvent) -> i32 {
        info!(
            "minor {}: calling helper {} {}",
            minor,
            self.program.display(),
            event.as_str()
        );
        match std::process::Command::new(&self.program)
            .arg(event.as_str())
            .env("BLKREPL_MINOR", minor.to_string())
            .status()
        {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("helper {} failed to run: {}", self.program.display(), e);
                -1
            }
        }
    }
}
