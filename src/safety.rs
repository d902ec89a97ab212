// Emergency stop and shutdown
//
// Every exit path (signal, panic, hardware fault, normal shutdown) funnels
// through Lifecycle::emergency_stop. Only the first call does anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::shared::{ControlShared, LoopState};

const POLL: Duration = Duration::from_millis(1);

pub struct Lifecycle {
    shared: Arc<ControlShared>,
    tick_period: Duration,
    stopped: AtomicBool,
}

impl Lifecycle {
    pub fn new(shared: Arc<ControlShared>, tick_period: Duration) -> Self {
        Self {
            shared,
            tick_period,
            stopped: AtomicBool::new(false),
        }
    }

    /// Zero all targets, tell the actuation thread to cut and release the
    /// outputs, and wait at most one tick for it to confirm.
    ///
    /// Returns `true` for the call that actually performed the stop. Never
    /// panics, so it is safe to call from a panic hook.
    pub fn emergency_stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("Emergency stop");

        self.shared.stop();
        self.shared.request_halt();

        let deadline = Instant::now() + self.tick_period;
        loop {
            match self.shared.loop_state() {
                LoopState::Running => {}
                LoopState::Halted => {
                    info!("Motors stopped and outputs released");
                    break;
                }
                LoopState::Faulted(reason) => {
                    warn!("Actuation loop already down ({}), outputs released on exit", reason);
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!("Actuation loop did not confirm the stop within one tick");
                break;
            }
            thread::sleep(POLL);
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Run the emergency stop before the default panic report
pub fn install_panic_hook(lifecycle: Arc<Lifecycle>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        lifecycle.emergency_stop();
        default_hook(info);
    }));
}
