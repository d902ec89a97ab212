// Hardware output seam
//
// The actuation loop only needs three primitives per motor channel: set the
// direction, set the duty percentage, and release everything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// Direction of one H-bridge channel
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Stop = 0,
    Forward = 1,
    Reverse = 2,
}

impl Direction {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Direction::Forward,
            2 => Direction::Reverse,
            _ => Direction::Stop,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[cfg(feature = "gpio")]
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("Output has been released")]
    Released,

    #[error("Simulated output fault")]
    Simulated,
}

/// Physical motor outputs for a two-channel differential drive
pub trait MotorOutput: Send {
    fn set_direction(&mut self, side: Side, direction: Direction) -> Result<(), OutputError>;

    /// Duty in percent, already clamped to `[0, 100]`
    fn set_duty(&mut self, side: Side, duty: f32) -> Result<(), OutputError>;

    /// Push any buffered writes to the hardware. Called once per tick.
    fn flush(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    /// Drive everything low and hand the hardware back. Safe to call twice.
    fn release(&mut self) -> Result<(), OutputError>;
}

/// One recorded write on the simulated output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFrame {
    Direction(Side, Direction),
    Duty(Side, f32),
    Release,
}

const SIM_FRAME_CAPACITY: usize = 4096;

/// In-memory output for tests and bench runs without the motor board.
///
/// Clones share the same frame log, so a test can keep one handle while the
/// control loop owns the other.
#[derive(Debug, Clone)]
pub struct SimOutput {
    frames: Arc<Mutex<VecDeque<OutputFrame>>>,
    released: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
    capacity: usize,
}

impl Default for SimOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl SimOutput {
    pub fn new() -> Self {
        Self::with_capacity(SIM_FRAME_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(SIM_FRAME_CAPACITY)))),
            released: Arc::new(AtomicBool::new(false)),
            fail: Arc::new(AtomicBool::new(false)),
            capacity: capacity.max(1),
        }
    }

    /// Make every following write fail, as a disconnected board would
    pub fn inject_fault(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<OutputFrame> {
        match self.frames.lock() {
            Ok(frames) => frames.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    /// Last duty written to `side`, if any
    pub fn last_duty(&self, side: Side) -> Option<f32> {
        self.frames().into_iter().rev().find_map(|frame| match frame {
            OutputFrame::Duty(s, duty) if s == side => Some(duty),
            _ => None,
        })
    }

    pub fn last_direction(&self, side: Side) -> Option<Direction> {
        self.frames().into_iter().rev().find_map(|frame| match frame {
            OutputFrame::Direction(s, direction) if s == side => Some(direction),
            _ => None,
        })
    }

    fn record(&self, frame: OutputFrame) -> Result<(), OutputError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OutputError::Simulated);
        }
        if self.is_released() && frame != OutputFrame::Release {
            return Err(OutputError::Released);
        }
        if let Ok(mut frames) = self.frames.lock() {
            if frames.len() == self.capacity {
                frames.pop_front();
            }
            frames.push_back(frame);
        }
        Ok(())
    }
}

impl MotorOutput for SimOutput {
    fn set_direction(&mut self, side: Side, direction: Direction) -> Result<(), OutputError> {
        self.record(OutputFrame::Direction(side, direction))
    }

    fn set_duty(&mut self, side: Side, duty: f32) -> Result<(), OutputError> {
        self.record(OutputFrame::Duty(side, duty))
    }

    fn release(&mut self) -> Result<(), OutputError> {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Simulated output already released");
            return Ok(());
        }
        info!("Releasing simulated motor outputs");
        if let Ok(mut frames) = self.frames.lock() {
            if frames.len() == self.capacity {
                frames.pop_front();
            }
            frames.push_back(OutputFrame::Release);
        }
        Ok(())
    }
}

impl MotorOutput for Box<dyn MotorOutput> {
    fn set_direction(&mut self, side: Side, direction: Direction) -> Result<(), OutputError> {
        (**self).set_direction(side, direction)
    }

    fn set_duty(&mut self, side: Side, duty: f32) -> Result<(), OutputError> {
        (**self).set_duty(side, duty)
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        (**self).flush()
    }

    fn release(&mut self) -> Result<(), OutputError> {
        (**self).release()
    }
}

/// Release on drop, so a panicking control thread still lets go of the motors
pub(crate) struct ReleaseGuard<O: MotorOutput>(pub O);

impl<O: MotorOutput> Drop for ReleaseGuard<O> {
    fn drop(&mut self) {
        if let Err(e) = self.0.release() {
            warn!("Failed to release motor outputs on drop: {}", e);
        }
    }
}
