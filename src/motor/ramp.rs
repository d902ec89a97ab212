// Duty-cycle easing
//
// The output duty follows a tanh S-curve from the value it had when the target
// last changed toward the new target over `ramp_time` seconds.

/// Curve steepness. At +/- k/2 the raw tanh is within 0.05% of its asymptote.
pub const RAMP_SHAPE_K: f32 = 7.6;

/// Values above this are snapped to full duty
const SNAP_HIGH: f32 = 99.5;
/// Values below this are snapped to zero
const SNAP_LOW: f32 = 0.05;

/// Shaped duty at `elapsed` seconds into a ramp of `total_time` seconds.
///
/// The curve is `start + (target - start)/2 * (tanh(k/T * (t - T/2)) + 1)`,
/// rescaled by `1 / tanh(k/2)` so it starts exactly at `start` and lands
/// exactly on `target`.
///
/// A nonzero target never produces less than `min_duty`, and a ramp toward a
/// nonzero target never starts underneath it. A zero target ignores the floor
/// so a stop always reaches true zero.
pub fn tanh_ramp(start: f32, target: f32, elapsed: f32, total_time: f32, min_duty: f32) -> f32 {
    let start = if target != 0.0 && start < min_duty {
        min_duty
    } else {
        start
    };

    let progress = if total_time <= 0.0 {
        1.0
    } else {
        let t = elapsed.clamp(0.0, total_time);
        let edge = (RAMP_SHAPE_K / 2.0).tanh();
        let shaped = (RAMP_SHAPE_K / total_time * (t - total_time / 2.0)).tanh();
        ((shaped + edge) / (2.0 * edge)).clamp(0.0, 1.0)
    };

    let mut duty = (start + (target - start) * progress).clamp(0.0, 100.0);

    // Numerical cleanup
    if duty > SNAP_HIGH {
        duty = 100.0;
    } else if duty < SNAP_LOW {
        duty = 0.0;
    }

    if target != 0.0 && duty < min_duty {
        duty = min_duty;
    }

    duty
}

/// Ramp state for one motor channel
#[derive(Debug, Clone, Default)]
pub struct RampChannel {
    current: f32,
    start: f32,
    target: f32,
    elapsed: f32,
}

impl RampChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one tick and return the new output duty.
    ///
    /// A changed target restarts the ramp from the value currently being
    /// output. Re-sending the same target leaves the ramp clock running.
    pub fn tick(&mut self, target: f32, dt: f32, ramp_time: f32, min_duty: f32) -> f32 {
        if target != self.target {
            self.target = target;
            self.start = self.current;
            self.elapsed = 0.0;
        } else {
            self.elapsed = (self.elapsed + dt).clamp(0.0, ramp_time.max(0.0));
        }

        self.current = tanh_ramp(self.start, self.target, self.elapsed, ramp_time, min_duty);
        self.current
    }

    /// Zero everything at once. Only the emergency stop does this.
    pub fn halt(&mut self) {
        *self = Self::default();
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }
}
