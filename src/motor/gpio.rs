// Raspberry Pi GPIO output for the dual H-bridge
//
// Each side has two direction pins (IN1/IN2) and one PWM pin. IN1 high and
// IN2 low drives forward, the reverse swaps them, both low lets the motor
// coast. Duty goes out as software PWM on the enable pin.
//
// The pin map is always available; the driver itself needs the `gpio`
// feature (rppal).

use serde::Deserialize;

use super::output::Direction;
use crate::config::{LEFT_IN1_PIN, LEFT_IN2_PIN, LEFT_PWM_PIN, RIGHT_IN1_PIN, RIGHT_IN2_PIN, RIGHT_PWM_PIN};

/// BCM pin numbers for both channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PinMap {
    pub left_pwm: u8,
    pub left_in1: u8,
    pub left_in2: u8,
    pub right_pwm: u8,
    pub right_in1: u8,
    pub right_in2: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            left_pwm: LEFT_PWM_PIN,
            left_in1: LEFT_IN1_PIN,
            left_in2: LEFT_IN2_PIN,
            right_pwm: RIGHT_PWM_PIN,
            right_in1: RIGHT_IN1_PIN,
            right_in2: RIGHT_IN2_PIN,
        }
    }
}

/// (IN1, IN2) levels for a direction
pub fn direction_levels(direction: Direction) -> (bool, bool) {
    match direction {
        Direction::Forward => (true, false),
        Direction::Reverse => (false, true),
        Direction::Stop => (false, false),
    }
}

/// Duty percent to the `[0.0, 1.0]` fraction rppal expects
pub fn duty_fraction(duty: f32) -> f64 {
    if duty.is_finite() {
        f64::from(duty.clamp(0.0, 100.0)) / 100.0
    } else {
        0.0
    }
}

#[cfg(feature = "gpio")]
pub use driver::GpioOutput;

#[cfg(feature = "gpio")]
mod driver {
    use rppal::gpio::{Gpio, OutputPin};
    use tracing::{debug, info};

    use super::{PinMap, direction_levels, duty_fraction};
    use crate::motor::output::{Direction, MotorOutput, OutputError, Side};

    struct Channel {
        pwm: OutputPin,
        in1: OutputPin,
        in2: OutputPin,
    }

    impl Channel {
        fn open(gpio: &Gpio, pwm: u8, in1: u8, in2: u8) -> Result<Self, rppal::gpio::Error> {
            Ok(Self {
                pwm: gpio.get(pwm)?.into_output_low(),
                in1: gpio.get(in1)?.into_output_low(),
                in2: gpio.get(in2)?.into_output_low(),
            })
        }

        fn set_direction(&mut self, direction: Direction) {
            let (in1, in2) = direction_levels(direction);
            set_level(&mut self.in1, in1);
            set_level(&mut self.in2, in2);
        }

        fn idle(&mut self) -> Result<(), rppal::gpio::Error> {
            self.pwm.clear_pwm()?;
            self.pwm.set_low();
            self.in1.set_low();
            self.in2.set_low();
            Ok(())
        }
    }

    fn set_level(pin: &mut OutputPin, high: bool) {
        if high {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    pub struct GpioOutput {
        left: Channel,
        right: Channel,
        pwm_freq_hz: f64,
        released: bool,
    }

    impl GpioOutput {
        pub fn open(pins: &PinMap, pwm_freq_hz: f64) -> Result<Self, OutputError> {
            let gpio = Gpio::new()?;
            let mut output = Self {
                left: Channel::open(&gpio, pins.left_pwm, pins.left_in1, pins.left_in2)?,
                right: Channel::open(&gpio, pins.right_pwm, pins.right_in1, pins.right_in2)?,
                pwm_freq_hz,
                released: false,
            };
            output.set_duty(Side::Left, 0.0)?;
            output.set_duty(Side::Right, 0.0)?;
            info!("GPIO motor output ready: {:?}, PWM {}Hz", pins, pwm_freq_hz);
            Ok(output)
        }

        fn channel(&mut self, side: Side) -> &mut Channel {
            match side {
                Side::Left => &mut self.left,
                Side::Right => &mut self.right,
            }
        }
    }

    impl MotorOutput for GpioOutput {
        fn set_direction(&mut self, side: Side, direction: Direction) -> Result<(), OutputError> {
            if self.released {
                return Err(OutputError::Released);
            }
            self.channel(side).set_direction(direction);
            Ok(())
        }

        fn set_duty(&mut self, side: Side, duty: f32) -> Result<(), OutputError> {
            if self.released {
                return Err(OutputError::Released);
            }
            let freq = self.pwm_freq_hz;
            self.channel(side).pwm.set_pwm_frequency(freq, duty_fraction(duty))?;
            Ok(())
        }

        fn release(&mut self) -> Result<(), OutputError> {
            if self.released {
                debug!("GPIO output already released");
                return Ok(());
            }
            self.released = true;
            info!("Releasing GPIO motor outputs");
            let left = self.left.idle();
            let right = self.right.idle();
            left?;
            right?;
            Ok(())
        }
    }
}
