//! Per-connection session state: the effective namespace (`SWITCHDB`) and
//! the rate-limiting clocks for the progress and heartbeat callbacks.

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

/// One query session bound to a single inbound connection. `namespace_exists`
/// is the seam an external catalog implements; this crate only tracks which
/// namespace is currently selected and whether switching to a given name is
/// allowed.
pub struct Session {
    namespace: RefCell<Option<String>>,
    namespace_exists: Box<dyn Fn(&str) -> bool>,
    heartbeat_interval: Duration,
    last_heartbeat: Cell<Instant>,
    progress_interval: Duration,
    last_progress: Cell<Instant>,
}

impl Session {
    pub fn new(
        namespace_exists: impl Fn(&str) -> bool + 'static,
        heartbeat_interval: Duration,
        progress_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            namespace: RefCell::new(None),
            namespace_exists: Box::new(namespace_exists),
            heartbeat_interval,
            last_heartbeat: Cell::new(now),
            progress_interval,
            last_progress: Cell::new(now),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace.borrow().clone()
    }

    /// Attempts a `SWITCHDB`. Returns `false` (and leaves the session
    /// untouched) if the catalog doesn't recognize `name`.
    pub fn switch_database(&self, name: &str) -> bool {
        if !(self.namespace_exists)(name) {
            return false;
        }
        *self.namespace.borrow_mut() = Some(name.to_string());
        true
    }

    pub fn heartbeat_due(&self) -> bool {
        self.last_heartbeat.get().elapsed() >= self.heartbeat_interval
    }

    pub fn mark_heartbeat(&self) {
        self.last_heartbeat.set(Instant::now());
    }

    pub fn progress_due(&self) -> bool {
        self.last_progress.get().elapsed() >= self.progress_interval
    }

    pub fn mark_progress(&self) {
        self.last_progress.set(Instant::now());
    }
}
