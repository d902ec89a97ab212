// Fixed-rate actuation loop
//
// Runs on its own OS thread so it keeps ticking no matter what the network
// side is doing. Each tick: smooth the velocity target, run the duty ramp,
// write the outputs, publish a snapshot.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::motor::{ActuationController, DriveGeometry, OutputError, VelocitySmoother};
use crate::shared::{ControlShared, ControlSnapshot, LoopState};

pub struct ControlLoop {
    shared: Arc<ControlShared>,
    actuation: ActuationController,
    smoother: VelocitySmoother,
    geometry: DriveGeometry,
    period: Duration,
    tick: u64,
}

impl ControlLoop {
    pub fn new(
        shared: Arc<ControlShared>,
        actuation: ActuationController,
        smoother: VelocitySmoother,
        geometry: DriveGeometry,
        period: Duration,
    ) -> Self {
        Self {
            shared,
            actuation,
            smoother,
            geometry,
            period,
            tick: 0,
        }
    }

    /// One control tick. Reads each shared field exactly once.
    pub fn step(&mut self) -> Result<ControlSnapshot, OutputError> {
        let target = self.shared.velocity_target();
        let command = self.shared.command();
        let limits = self.shared.limits();

        let smoothed = self.smoother.update(target.v, target.w);
        let wheels = self.geometry.body_to_wheel(smoothed.v, smoothed.w);
        let duty = self.actuation.tick(command, limits)?;

        self.tick += 1;
        let snapshot = ControlSnapshot {
            tick: self.tick,
            duty,
            smoothed,
            wheels,
        };
        self.shared.publish(snapshot);
        Ok(snapshot)
    }

    /// Zero the outputs at once and release the hardware
    pub fn halt(&mut self) -> Result<(), OutputError> {
        self.smoother.reset();
        let result = self.actuation.halt();
        self.shared.publish(ControlSnapshot {
            tick: self.tick,
            ..Default::default()
        });
        result
    }

    /// Start the loop on a dedicated thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("actuation".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let _exit = ExitGuard(Arc::clone(&shared));
        info!("Actuation loop started: {:?} tick", self.period);

        let mut next = Instant::now();
        loop {
            if shared.halt_requested() {
                match self.halt() {
                    Ok(()) => info!("Actuation loop halted, outputs released"),
                    Err(e) => warn!("Halt completed with output error: {}", e),
                }
                shared.set_loop_state(LoopState::Halted);
                return;
            }

            if let Err(e) = self.step() {
                error!("Hardware output failed: {}", e);
                if let Err(halt_err) = self.halt() {
                    warn!("Stop after hardware fault also failed: {}", halt_err);
                }
                shared.set_loop_state(LoopState::Faulted(e.to_string()));
                return;
            }

            next += self.period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                debug!("Actuation tick overran by {:?}", now - next);
                next = now;
            }
        }
    }
}

/// Marks the loop as gone if the thread unwinds without reporting
struct ExitGuard(Arc<ControlShared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.0.loop_state() == LoopState::Running {
            self.0
                .set_loop_state(LoopState::Faulted("actuation thread exited unexpectedly".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Direction, DutyLimits, Side, SimOutput};
    use crate::shared::LoopState;

    fn make_loop(sim: &SimOutput) -> (ControlLoop, Arc<ControlShared>) {
        let shared = Arc::new(ControlShared::new(DutyLimits::new(40.0, 100.0)));
        let actuation = ActuationController::new(Box::new(sim.clone()), 50, 1.0);
        let control = ControlLoop::new(
            Arc::clone(&shared),
            actuation,
            VelocitySmoother::new(0.5, 2.0, 50),
            DriveGeometry::default(),
            Duration::from_millis(20),
        );
        (control, shared)
    }

    #[test]
    fn test_command_reflected_on_next_tick() {
        let sim = SimOutput::new();
        let (mut control, shared) = make_loop(&sim);
        control.step().unwrap();

        shared.set_command(Direction::Forward, Direction::Forward, 70.0);
        let snapshot = control.step().unwrap();
        assert_eq!(snapshot.duty.target_l, 70.0);
        assert_eq!(snapshot.duty.direction_r, Direction::Forward);
        assert_eq!(shared.snapshot(), snapshot);
    }

    #[test]
    fn test_stop_reaches_zero_before_next_write() {
        let sim = SimOutput::new();
        let (mut control, shared) = make_loop(&sim);
        shared.set_command(Direction::Forward, Direction::Forward, 70.0);
        for _ in 0..60 {
            control.step().unwrap();
        }
        assert!((shared.snapshot().duty.current_l - 70.0).abs() < 1e-3);

        shared.stop();
        let snapshot = control.step().unwrap();
        assert_eq!(snapshot.duty.target_l, 0.0);
        assert_eq!(snapshot.duty.target_r, 0.0);
        // Ramped, not cut
        assert!(snapshot.duty.current_l > 60.0);

        for _ in 0..60 {
            control.step().unwrap();
        }
        assert_eq!(sim.last_duty(Side::Left), Some(0.0));
    }

    #[test]
    fn test_smoothed_velocity_in_snapshot() {
        let sim = SimOutput::new();
        let (mut control, shared) = make_loop(&sim);
        shared.set_velocity_target(crate::motor::BodyVelocity::new(0.5, 0.0));
        let first = control.step().unwrap();
        assert!((first.smoothed.v - 0.01).abs() < 1e-6);
        assert!(first.wheels.left > 0.0);
    }

    #[test]
    fn test_thread_halts_and_releases() {
        let sim = SimOutput::new();
        let (control, shared) = make_loop(&sim);
        shared.set_command(Direction::Forward, Direction::Forward, 70.0);
        let handle = control.spawn().unwrap();
        thread::sleep(Duration::from_millis(100));

        shared.request_halt();
        handle.join().unwrap();
        assert_eq!(shared.loop_state(), LoopState::Halted);
        assert!(sim.is_released());
        assert_eq!(shared.snapshot().duty.current_l, 0.0);
    }

    #[test]
    fn test_thread_reports_hardware_fault() {
        let sim = SimOutput::new();
        let (control, shared) = make_loop(&sim);
        let handle = control.spawn().unwrap();
        sim.inject_fault();
        handle.join().unwrap();
        assert!(matches!(shared.loop_state(), LoopState::Faulted(_)));
        assert!(sim.is_released());
    }
}
