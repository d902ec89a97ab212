// Motor control module for the differential drive base
//
// Provides:
// - Differential drive inverse kinematics (body velocity -> wheel velocities)
// - Bounded-acceleration velocity smoothing
// - tanh duty ramp and the actuation controller that drives it
// - Hardware outputs: Raspberry Pi GPIO/PWM and an in-memory simulation

pub mod actuation;
pub mod gpio;
pub mod kinematics;
pub mod output;
pub mod ramp;
pub mod smoother;

pub use actuation::{ActuationController, DriveCommand, DutyLimits, DutyState};
#[cfg(feature = "gpio")]
pub use gpio::GpioOutput;
pub use gpio::PinMap;
pub use kinematics::{DriveGeometry, WheelVelocity, body_to_wheel};
pub use output::{Direction, MotorOutput, OutputError, OutputFrame, Side, SimOutput};
pub use ramp::{RampChannel, tanh_ramp};
pub use smoother::{BodyVelocity, VelocitySmoother};
