// Bounded-acceleration velocity smoother
//
// Advances the current (v, w) toward the target by at most max_accel * dt per
// update. Called once per control tick, with or without a new command.

use serde::Serialize;

/// Linear/angular velocity pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BodyVelocity {
    pub v: f32,
    pub w: f32,
}

impl BodyVelocity {
    pub fn new(v: f32, w: f32) -> Self {
        Self { v, w }
    }
}

#[derive(Debug, Clone)]
pub struct VelocitySmoother {
    current: BodyVelocity,
    max_accel: f32,
    max_ang_accel: f32,
    dt: f32,
}

impl VelocitySmoother {
    pub fn new(max_accel: f32, max_ang_accel: f32, rate_hz: u32) -> Self {
        Self {
            current: BodyVelocity::default(),
            max_accel: max_accel.abs(),
            max_ang_accel: max_ang_accel.abs(),
            dt: 1.0 / rate_hz.max(1) as f32,
        }
    }

    /// Step toward the target and return the new smoothed velocity
    pub fn update(&mut self, v_target: f32, w_target: f32) -> BodyVelocity {
        let max_dv = self.max_accel * self.dt;
        let max_dw = self.max_ang_accel * self.dt;

        let dv = (v_target - self.current.v).clamp(-max_dv, max_dv);
        let dw = (w_target - self.current.w).clamp(-max_dw, max_dw);

        self.current.v += dv;
        self.current.w += dw;
        self.current
    }

    pub fn current(&self) -> BodyVelocity {
        self.current
    }

    /// Drop straight to rest, used by the emergency stop only
    pub fn reset(&mut self) {
        self.current = BodyVelocity::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceleration_is_bounded() {
        let mut smoother = VelocitySmoother::new(0.5, 2.0, 50);
        let max_dv = 0.5 / 50.0 + 1e-6;
        let max_dw = 2.0 / 50.0 + 1e-6;

        // Operator bashing between extremes
        let targets = [(0.5, 0.0), (-0.5, 0.8), (0.0, -0.8), (0.5, 0.8), (0.0, 0.0)];
        let mut prev = smoother.current();
        for &(v, w) in targets.iter().cycle().take(400) {
            for _ in 0..7 {
                let next = smoother.update(v, w);
                assert!((next.v - prev.v).abs() <= max_dv, "dv {}", next.v - prev.v);
                assert!((next.w - prev.w).abs() <= max_dw, "dw {}", next.w - prev.w);
                prev = next;
            }
        }
    }

    #[test]
    fn test_converges_to_target() {
        let mut smoother = VelocitySmoother::new(0.5, 2.0, 50);
        // 0.5 m/s at 0.5 m/s^2 takes one second
        for _ in 0..50 {
            smoother.update(0.5, 0.0);
        }
        assert!((smoother.current().v - 0.5).abs() < 1e-4);

        // Holds the target once reached, no overshoot
        let held = smoother.update(0.5, 0.0);
        assert!((held.v - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let mut a = VelocitySmoother::new(0.5, 2.0, 50);
        let mut b = VelocitySmoother::new(0.5, 2.0, 50);
        for i in 0..30 {
            let target = if i % 3 == 0 { 0.4 } else { -0.2 };
            assert_eq!(a.update(target, 0.3), b.update(target, 0.3));
        }
    }

    #[test]
    fn test_keeps_decaying_without_new_command() {
        let mut smoother = VelocitySmoother::new(0.5, 2.0, 50);
        for _ in 0..50 {
            smoother.update(0.5, 0.0);
        }
        // Stop arrives once, then every tick repeats the same target
        let mut last = smoother.current().v;
        for _ in 0..10 {
            let v = smoother.update(0.0, 0.0).v;
            assert!(v < last);
            last = v;
        }
    }
}
