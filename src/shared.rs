// State shared between the network tasks and the actuation thread.
//
// Every cross-domain write is a single atomic store of one packed 64-bit
// word, so the tick thread can never observe half of a command. The tick
// thread publishes complete snapshots back through a `watch` channel; readers
// copy the latest snapshot and never hold a lock across I/O.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;

use crate::motor::{BodyVelocity, Direction, DriveCommand, DutyLimits, DutyState, WheelVelocity};

/// A value that fits in one `u64`
pub trait Packed: Copy {
    fn pack(self) -> u64;
    fn unpack(raw: u64) -> Self;
}

fn pack_pair(lo: f32, hi: f32) -> u64 {
    (lo.to_bits() as u64) | ((hi.to_bits() as u64) << 32)
}

fn unpack_pair(raw: u64) -> (f32, f32) {
    (f32::from_bits(raw as u32), f32::from_bits((raw >> 32) as u32))
}

impl Packed for DriveCommand {
    fn pack(self) -> u64 {
        (self.target_duty.to_bits() as u64)
            | ((self.direction_l as u8 as u64) << 32)
            | ((self.direction_r as u8 as u64) << 40)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            target_duty: f32::from_bits(raw as u32),
            direction_l: Direction::from_u8((raw >> 32) as u8),
            direction_r: Direction::from_u8((raw >> 40) as u8),
        }
    }
}

impl Packed for BodyVelocity {
    fn pack(self) -> u64 {
        pack_pair(self.v, self.w)
    }

    fn unpack(raw: u64) -> Self {
        let (v, w) = unpack_pair(raw);
        Self { v, w }
    }
}

impl Packed for DutyLimits {
    fn pack(self) -> u64 {
        pack_pair(self.min_duty, self.max_duty)
    }

    fn unpack(raw: u64) -> Self {
        let (min_duty, max_duty) = unpack_pair(raw);
        Self { min_duty, max_duty }
    }
}

/// Lock-free cell holding one [`Packed`] value
pub struct AtomicSlot<T: Packed> {
    raw: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Packed> AtomicSlot<T> {
    pub fn new(value: T) -> Self {
        Self {
            raw: AtomicU64::new(value.pack()),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> T {
        T::unpack(self.raw.load(Ordering::Acquire))
    }

    pub fn store(&self, value: T) {
        self.raw.store(value.pack(), Ordering::Release);
    }

    /// Store and return the previous value
    pub fn swap(&self, value: T) -> T {
        T::unpack(self.raw.swap(value.pack(), Ordering::AcqRel))
    }
}

/// Everything the tick thread produced on its latest tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ControlSnapshot {
    pub tick: u64,
    pub duty: DutyState,
    pub smoothed: BodyVelocity,
    pub wheels: WheelVelocity,
}

/// Lifecycle of the actuation thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Outputs zeroed and released after a halt request
    Halted,
    /// The hardware rejected a write; the process must terminate
    Faulted(String),
}

pub struct ControlShared {
    command: AtomicSlot<DriveCommand>,
    velocity_target: AtomicSlot<BodyVelocity>,
    limits: AtomicSlot<DutyLimits>,
    halt: AtomicBool,
    snapshot: watch::Sender<ControlSnapshot>,
    state: watch::Sender<LoopState>,
}

impl ControlShared {
    pub fn new(limits: DutyLimits) -> Self {
        let (snapshot, _) = watch::channel(ControlSnapshot::default());
        let (state, _) = watch::channel(LoopState::Running);
        Self {
            command: AtomicSlot::new(DriveCommand::stop()),
            velocity_target: AtomicSlot::new(BodyVelocity::default()),
            limits: AtomicSlot::new(limits),
            halt: AtomicBool::new(false),
            snapshot,
            state,
        }
    }

    /// Set direction and target duty for both channels. Seen by the tick
    /// thread on its next tick.
    pub fn set_command(&self, direction_l: Direction, direction_r: Direction, target_duty: f32) -> DriveCommand {
        let command = DriveCommand::new(direction_l, direction_r, target_duty);
        self.command.store(command);
        command
    }

    pub fn command(&self) -> DriveCommand {
        self.command.load()
    }

    pub fn set_velocity_target(&self, target: BodyVelocity) {
        self.velocity_target.store(target);
    }

    pub fn velocity_target(&self) -> BodyVelocity {
        self.velocity_target.load()
    }

    /// Ramp both channels and the velocity target down to zero
    pub fn stop(&self) {
        self.command.store(DriveCommand::stop());
        self.velocity_target.store(BodyVelocity::default());
    }

    pub fn limits(&self) -> DutyLimits {
        self.limits.load()
    }

    pub fn swap_limits(&self, limits: DutyLimits) -> DutyLimits {
        self.limits.swap(limits)
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub fn publish(&self, snapshot: ControlSnapshot) {
        self.snapshot.send_replace(snapshot);
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> ControlSnapshot {
        *self.snapshot.borrow()
    }

    pub fn set_loop_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    pub fn loop_state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    pub fn subscribe_loop_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }
}
