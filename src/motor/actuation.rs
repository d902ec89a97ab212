// Actuation controller
//
// Turns a direction + target duty command into a continuously ramped duty
// signal on both motor channels. Direction pins switch on the next tick;
// only the magnitude is ramped. Reversing while the duty is nonzero flips the
// pins straight away, the ramp does not pass through zero first.

use serde::Serialize;
use tracing::{debug, warn};

use super::output::{Direction, MotorOutput, OutputError, ReleaseGuard, Side};
use super::ramp::RampChannel;

/// Direction per side plus one target magnitude
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveCommand {
    pub direction_l: Direction,
    pub direction_r: Direction,
    pub target_duty: f32,
}

impl DriveCommand {
    /// Build a validated command: duty clamped into `[0, 100]` and forced to
    /// zero when both sides are stopped.
    pub fn new(direction_l: Direction, direction_r: Direction, target_duty: f32) -> Self {
        let mut target_duty = if target_duty.is_finite() {
            target_duty.clamp(0.0, 100.0)
        } else {
            0.0
        };
        if direction_l == Direction::Stop && direction_r == Direction::Stop {
            target_duty = 0.0;
        }
        Self {
            direction_l,
            direction_r,
            target_duty,
        }
    }

    pub fn stop() -> Self {
        Self::default()
    }

    pub fn is_stop(&self) -> bool {
        self.target_duty == 0.0
    }

    /// Target for one side; a stopped side always targets zero
    pub fn target_for(&self, side: Side) -> f32 {
        let direction = match side {
            Side::Left => self.direction_l,
            Side::Right => self.direction_r,
        };
        if direction == Direction::Stop {
            0.0
        } else {
            self.target_duty
        }
    }
}

/// Runtime-adjustable duty bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DutyLimits {
    #[serde(rename = "min")]
    pub min_duty: f32,
    #[serde(rename = "max")]
    pub max_duty: f32,
}

impl DutyLimits {
    pub fn new(a: f32, b: f32) -> Self {
        let (min_duty, max_duty) = crate::config::sanitize_duty_limits(a, b);
        Self { min_duty, max_duty }
    }
}

impl Default for DutyLimits {
    fn default() -> Self {
        Self::new(crate::config::MIN_DUTY, crate::config::MAX_DUTY)
    }
}

/// What the actuators are doing after a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DutyState {
    pub current_l: f32,
    pub current_r: f32,
    pub target_l: f32,
    pub target_r: f32,
    pub direction_l: Direction,
    pub direction_r: Direction,
}

pub struct ActuationController {
    output: ReleaseGuard<Box<dyn MotorOutput>>,
    left: RampChannel,
    right: RampChannel,
    dt: f32,
    ramp_time: f32,
    trim_left: f32,
    trim_right: f32,
    state: DutyState,
}

impl ActuationController {
    pub fn new(output: Box<dyn MotorOutput>, tick_hz: u32, ramp_time_s: f32) -> Self {
        Self {
            output: ReleaseGuard(output),
            left: RampChannel::new(),
            right: RampChannel::new(),
            dt: 1.0 / tick_hz.max(1) as f32,
            ramp_time: ramp_time_s.max(0.0),
            trim_left: 1.0,
            trim_right: 1.0,
            state: DutyState::default(),
        }
    }

    /// Per-side correction factors applied at output write
    pub fn with_trim(mut self, left: f32, right: f32) -> Self {
        self.trim_left = left;
        self.trim_right = right;
        self
    }

    /// Advance both ramps by one tick and write the result.
    ///
    /// Writes happen every tick even when nothing changed; the PWM board
    /// expects a continuous refresh.
    pub fn tick(&mut self, command: DriveCommand, limits: DutyLimits) -> Result<DutyState, OutputError> {
        let target_l = command.target_for(Side::Left).min(limits.max_duty);
        let target_r = command.target_for(Side::Right).min(limits.max_duty);

        let current_l = self.left.tick(target_l, self.dt, self.ramp_time, limits.min_duty);
        let current_r = self.right.tick(target_r, self.dt, self.ramp_time, limits.min_duty);

        if command.direction_l != self.state.direction_l || command.direction_r != self.state.direction_r {
            debug!(
                "Direction change: left {:?} -> {:?}, right {:?} -> {:?}",
                self.state.direction_l, command.direction_l, self.state.direction_r, command.direction_r
            );
        }

        self.state = DutyState {
            current_l,
            current_r,
            target_l,
            target_r,
            direction_l: command.direction_l,
            direction_r: command.direction_r,
        };
        self.write()?;
        Ok(self.state)
    }

    fn write(&mut self) -> Result<(), OutputError> {
        let out = &mut self.output.0;
        out.set_direction(Side::Left, self.state.direction_l)?;
        out.set_direction(Side::Right, self.state.direction_r)?;
        out.set_duty(Side::Left, (self.state.current_l * self.trim_left).clamp(0.0, 100.0))?;
        out.set_duty(Side::Right, (self.state.current_r * self.trim_right).clamp(0.0, 100.0))?;
        out.flush()
    }

    /// Zero both channels immediately and release the hardware.
    /// The ramp is skipped; this is the only discontinuous path.
    pub fn halt(&mut self) -> Result<(), OutputError> {
        self.left.halt();
        self.right.halt();
        self.state = DutyState::default();

        let zeroed = self.write();
        if let Err(ref e) = zeroed {
            warn!("Failed to write zero duty during halt: {}", e);
        }
        // Release regardless of whether the zero write went through
        self.output.0.release()?;
        zeroed
    }

    pub fn state(&self) -> DutyState {
        self.state
    }
}
