use std::cell::{Cell, RefCell};

use crate::Clock;

/// Request-recording [`Clock`] for cooperative main loops.
///
/// Trap hooks and commands post run/stop/step requests here; the embedding
/// loop drains them between instructions with [`MonitorClock::take_steps`]
/// and [`MonitorClock::take_stop`].
#[derive(Default)]
pub struct MonitorClock {
    running: Cell<bool>,
    pending_steps: Cell<u32>,
    stop_msg: RefCell<Option<String>>,
}

impl MonitorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps requested since the last drain.
    pub fn take_steps(&self) -> u32 {
        self.pending_steps.replace(0)
    }

    /// The message of the most recent stop, if one happened.
    pub fn take_stop(&self) -> Option<String> {
        self.stop_msg.borrow_mut().take()
    }
}

impl Clock for MonitorClock {
    fn start(&self) {
        self.running.set(true);
    }

    fn stop(&self, msg: &str) {
        self.running.set(false);
        *self.stop_msg.borrow_mut() = Some(msg.to_owned());
    }

    fn on_step(&self, n: u32) {
        self.pending_steps.set(self.pending_steps.get().saturating_add(n));
    }

    fn running(&self) -> bool {
        self.running.get()
    }
}
