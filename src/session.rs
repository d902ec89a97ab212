// Command sessions
//
// One WebSocket connection is one CommandSession. The newest connection
// holds control; older ones keep telemetry and may ping or stop the robot,
// but cannot drive it. Closing the controlling session always stops the
// motors before anything else is torn down.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::messages::{Command, MotionKind, Outbound, ProtocolError, SidePair};
use crate::motor::{BodyVelocity, DutyLimits};
use crate::runtime::RuntimeContext;
use crate::shared::LoopState;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Controller,
    Observer,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct RegistryInner {
    next_id: SessionId,
    controller: Option<SessionId>,
    sessions: HashMap<SessionId, SocketAddr>,
}

/// Live sessions keyed by id, with at most one controller
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session and hand it control. Returns the id and the session
    /// that held control before, if any.
    pub fn register(&self, peer: SocketAddr) -> (SessionId, Option<SessionId>) {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.sessions.insert(id, peer);
        let previous = inner.controller.replace(id);
        (id, previous)
    }

    /// Remove a session, freeing the controller slot if it held it
    pub fn unregister(&self, id: SessionId) -> Option<Role> {
        let mut inner = lock(&self.inner);
        inner.sessions.remove(&id)?;
        if inner.controller == Some(id) {
            inner.controller = None;
            Some(Role::Controller)
        } else {
            Some(Role::Observer)
        }
    }

    pub fn role(&self, id: SessionId) -> Option<Role> {
        let inner = lock(&self.inner);
        if !inner.sessions.contains_key(&id) {
            return None;
        }
        if inner.controller == Some(id) {
            Some(Role::Controller)
        } else {
            Some(Role::Observer)
        }
    }

    pub fn controller(&self) -> Option<SessionId> {
        lock(&self.inner).controller
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedCommand {
    /// Seconds since the unix epoch
    pub timestamp: f64,
    pub action: String,
}

/// Bounded in-memory window of recent commands. Oldest entries fall off.
pub struct CommandLog {
    capacity: usize,
    entries: Mutex<VecDeque<LoggedCommand>>,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, action: &str) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let mut entries = lock(&self.entries);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LoggedCommand {
            timestamp,
            action: action.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<LoggedCommand> {
        lock(&self.entries).back().cloned()
    }

    pub fn entries(&self) -> Vec<LoggedCommand> {
        lock(&self.entries).iter().cloned().collect()
    }
}

pub struct CommandSession {
    id: SessionId,
    peer: SocketAddr,
    ctx: Arc<RuntimeContext>,
    closed: bool,
}

impl CommandSession {
    pub fn open(ctx: Arc<RuntimeContext>, peer: SocketAddr) -> Self {
        let (id, previous) = ctx.registry.register(peer);
        match previous {
            Some(previous) => info!("Session {} connected from {}, took control from session {}", id, peer, previous),
            None => info!("Session {} connected from {} as controller", id, peer),
        }
        Self {
            id,
            peer,
            ctx,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.ctx.registry.role(self.id).unwrap_or(Role::Observer)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Handle one inbound text frame and produce the reply.
    /// Protocol errors never touch the actuators.
    pub fn handle_text(&self, text: &str) -> Outbound {
        let (action, command) = match Command::parse(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Session {}: rejected message: {}", self.id, e);
                return Outbound::error(&e);
            }
        };
        self.ctx.log.record(&action);

        match self.apply(command) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Session {}: {} rejected: {}", self.id, action, e);
                Outbound::error(&e)
            }
        }
    }

    fn apply(&self, command: Command) -> Result<Outbound, ProtocolError> {
        // Anyone may bring the robot to rest
        if !command.is_stop() && !matches!(command, Command::Ping { .. }) {
            self.require_control()?;
            self.require_running()?;
        }
        match command {
            Command::Ping { timestamp } => Ok(Outbound::pong(timestamp)),
            Command::Motion { kind, duty } => Ok(self.drive(kind, duty)),
            Command::SetDuty { a, b } => Ok(self.set_duty(a, b)),
        }
    }

    fn require_control(&self) -> Result<(), ProtocolError> {
        if self.role() == Role::Controller {
            Ok(())
        } else {
            Err(ProtocolError::NotController)
        }
    }

    fn require_running(&self) -> Result<(), ProtocolError> {
        if self.ctx.shared.loop_state() == LoopState::Running {
            Ok(())
        } else {
            Err(ProtocolError::NotRunning)
        }
    }

    fn drive(&self, kind: MotionKind, duty: Option<f32>) -> Outbound {
        let shared = &self.ctx.shared;
        let fraction = duty.unwrap_or(100.0) / 100.0;
        let target_duty = shared.limits().max_duty * fraction;

        let base = kind.velocity();
        let target = BodyVelocity::new(base.v * fraction, base.w * fraction);
        let (direction_l, direction_r) = kind.directions();

        shared.set_velocity_target(target);
        let command = shared.set_command(direction_l, direction_r, target_duty);
        self.ctx.watchdog.on_command(!command.is_stop());
        debug!("Session {}: {:?} -> {:?}", self.id, kind, command);

        let wheels = self.ctx.geometry.body_to_wheel(target.v, target.w);
        let duty = shared.snapshot().duty;
        Outbound::motion_ack(
            kind,
            wheels,
            SidePair {
                left: duty.current_l,
                right: duty.current_r,
            },
        )
    }

    fn set_duty(&self, a: f32, b: f32) -> Outbound {
        let shared = &self.ctx.shared;
        // Stop first so nothing ramps under the old limits
        shared.stop();
        self.ctx.watchdog.on_command(false);

        let limits = DutyLimits::new(a, b);
        let previous = shared.swap_limits(limits);
        info!(
            "Updated duty cycle limits: min {} -> {}, max {} -> {}",
            previous.min_duty, limits.min_duty, previous.max_duty, limits.max_duty
        );
        Outbound::duty_ack(limits)
    }

    /// Stop the motors if this session was driving, then leave the registry.
    /// Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.role() == Role::Controller {
            self.ctx.shared.stop();
            self.ctx.watchdog.on_command(false);
            info!("Session {} ({}) disconnected, motors stopped", self.id, self.peer);
        } else {
            info!("Observer session {} ({}) disconnected", self.id, self.peer);
        }
        self.ctx.registry.unregister(self.id);
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::motor::Direction;
    use crate::shared::ControlShared;
    use serde_json::{Value, json};

    fn context() -> Arc<RuntimeContext> {
        let config = RuntimeConfig::default();
        let shared = Arc::new(ControlShared::new(DutyLimits::new(config.min_duty, config.max_duty)));
        Arc::new(RuntimeContext::new(config, shared))
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn reply(session: &CommandSession, text: &str) -> Value {
        serde_json::to_value(session.handle_text(text)).unwrap()
    }

    #[test]
    fn test_registry_newest_takes_control() {
        let registry = SessionRegistry::new();
        let (a, previous_a) = registry.register(peer(1));
        let (b, previous_b) = registry.register(peer(2));
        assert_eq!(previous_a, None);
        assert_eq!(previous_b, Some(a));
        assert_eq!(registry.controller(), Some(b));
        assert_eq!(registry.role(a), Some(Role::Observer));
        assert_eq!(registry.role(b), Some(Role::Controller));

        assert_eq!(registry.unregister(a), Some(Role::Observer));
        assert_eq!(registry.controller(), Some(b));
        assert_eq!(registry.unregister(b), Some(Role::Controller));
        assert_eq!(registry.controller(), None);
        assert!(registry.is_empty());
        assert_eq!(registry.unregister(42), None);
        assert_eq!(registry.role(42), None);
    }

    #[test]
    fn test_command_log_is_bounded() {
        let log = CommandLog::new(3);
        for action in ["FORWARD", "LEFT", "RIGHT", "DRIVE_STOP"] {
            log.record(action);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries()[0].action, "LEFT");
        assert_eq!(log.last().unwrap().action, "DRIVE_STOP");
    }

    #[test]
    fn test_forward_sets_targets_and_acks() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        let ack = reply(&session, r#"{"action":"FORWARD"}"#);

        assert_eq!(ack["status"], "ok");
        assert_eq!(ack["command"], "FORWARD");
        let left = ack["velocities"]["left"].as_f64().unwrap();
        assert!((left - 0.5 / 0.065).abs() < 1e-3);
        assert!(ack["duty_cycles"]["left"].is_number());

        let command = ctx.shared.command();
        assert_eq!(command.direction_l, Direction::Forward);
        assert_eq!(command.target_duty, 100.0);
        assert_eq!(ctx.shared.velocity_target(), BodyVelocity::new(0.5, 0.0));
    }

    #[test]
    fn test_partial_duty_scales_target() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        reply(&session, r#"{"action":"SET_DUTY 20 80"}"#);
        reply(&session, r#"{"action":"RIGHT","duty":50}"#);
        let command = ctx.shared.command();
        assert_eq!(command.target_duty, 40.0);
        assert_eq!(command.direction_l, Direction::Forward);
        assert_eq!(command.direction_r, Direction::Reverse);
    }

    #[test]
    fn test_set_duty_stops_then_swaps_limits() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        reply(&session, r#"{"action":"FORWARD"}"#);

        let ack = reply(&session, r#"{"action":"SET_DUTY 80 20"}"#);
        assert_eq!(ack["duty_limits"], json!({"min": 20.0, "max": 80.0}));
        assert!(ctx.shared.command().is_stop());

        reply(&session, r#"{"action":"FORWARD"}"#);
        assert!(ctx.shared.command().target_duty <= 80.0);
    }

    #[test]
    fn test_set_duty_out_of_range_is_clamped() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        reply(&session, r#"{"action":"SET_DUTY -10 250"}"#);
        assert_eq!(ctx.shared.limits(), DutyLimits::new(0.0, 100.0));
    }

    #[test]
    fn test_errors_leave_actuators_alone() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        reply(&session, r#"{"action":"FORWARD"}"#);
        let before = ctx.shared.command();

        let bad_json = reply(&session, "not json");
        assert_eq!(bad_json, json!({"status": "error", "msg": "Bad JSON"}));
        let unknown = reply(&session, r#"{"action":"SELF_DESTRUCT"}"#);
        assert_eq!(unknown, json!({"status": "error", "msg": "Invalid command"}));
        let bad_duty = reply(&session, r#"{"action":"SET_DUTY 10"}"#);
        assert_eq!(bad_duty["status"], "error");

        assert_eq!(ctx.shared.command(), before);
        assert_eq!(ctx.shared.limits(), DutyLimits::default());
    }

    #[test]
    fn test_ping_echoes_without_side_effects() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        let pong = reply(&session, r#"{"action":"PING","timestamp":1712345678901}"#);
        assert_eq!(pong, json!({"action": "PONG", "timestamp": 1712345678901u64}));
        assert!(ctx.shared.command().is_stop());
        assert_eq!(ctx.log.last().unwrap().action, "PING");
    }

    #[test]
    fn test_observer_cannot_drive() {
        let ctx = context();
        let observer = CommandSession::open(Arc::clone(&ctx), peer(1));
        let _controller = CommandSession::open(Arc::clone(&ctx), peer(2));
        assert_eq!(observer.role(), Role::Observer);

        let denied = reply(&observer, r#"{"action":"FORWARD"}"#);
        assert_eq!(denied["msg"], "Session is not the controller");
        let denied = reply(&observer, r#"{"action":"SET_DUTY 10 20"}"#);
        assert_eq!(denied["msg"], "Session is not the controller");
        assert!(ctx.shared.command().is_stop());
        assert_eq!(ctx.shared.limits(), DutyLimits::default());

        let pong = reply(&observer, r#"{"action":"PING","timestamp":1}"#);
        assert_eq!(pong["action"], "PONG");
    }

    #[test]
    fn test_any_session_can_stop() {
        let ctx = context();
        let observer = CommandSession::open(Arc::clone(&ctx), peer(1));
        let controller = CommandSession::open(Arc::clone(&ctx), peer(2));
        reply(&controller, r#"{"action":"FORWARD"}"#);

        let ack = reply(&observer, r#"{"action":"DRIVE_STOP"}"#);
        assert_eq!(ack["status"], "ok");
        assert!(ctx.shared.command().is_stop());
        assert_eq!(ctx.shared.velocity_target(), BodyVelocity::default());

        reply(&controller, r#"{"action":"LEFT"}"#);
        let ack = reply(&observer, r#"{"action":"RIGHT","duty":0}"#);
        assert_eq!(ack["status"], "ok");
        assert!(ctx.shared.command().is_stop());
    }

    #[test]
    fn test_reconnect_takes_over_stale_controller() {
        let ctx = context();
        // Link dropped but the old socket never closed
        let mut stale = CommandSession::open(Arc::clone(&ctx), peer(1));
        reply(&stale, r#"{"action":"FORWARD"}"#);

        let fresh = CommandSession::open(Arc::clone(&ctx), peer(2));
        assert_eq!(fresh.role(), Role::Controller);
        assert_eq!(stale.role(), Role::Observer);

        reply(&fresh, r#"{"action":"REVERSE"}"#);
        assert_eq!(ctx.shared.command().direction_l, Direction::Reverse);

        // The stale socket finally closing must not stop the new driver
        stale.close();
        assert!(!ctx.shared.command().is_stop());
        assert_eq!(ctx.registry.controller(), Some(fresh.id()));
    }

    #[test]
    fn test_halted_loop_refuses_motion() {
        let ctx = context();
        let session = CommandSession::open(Arc::clone(&ctx), peer(1));
        ctx.shared.set_loop_state(LoopState::Halted);

        let denied = reply(&session, r#"{"action":"FORWARD"}"#);
        assert_eq!(denied, json!({"status": "error", "msg": "Actuation loop is not running"}));
        let denied = reply(&session, r#"{"action":"SET_DUTY 20 80"}"#);
        assert_eq!(denied["msg"], "Actuation loop is not running");
        assert!(ctx.shared.command().is_stop());

        let ack = reply(&session, r#"{"action":"DRIVE_STOP"}"#);
        assert_eq!(ack["status"], "ok");
    }

    #[test]
    fn test_controller_disconnect_stops_motors() {
        let ctx = context();
        let mut session = CommandSession::open(Arc::clone(&ctx), peer(1));
        reply(&session, r#"{"action":"FORWARD"}"#);
        assert!(!ctx.shared.command().is_stop());

        session.close();
        assert!(ctx.shared.command().is_stop());
        assert_eq!(ctx.shared.velocity_target(), BodyVelocity::default());
        assert!(ctx.registry.is_empty());

        // Second close and the drop that follows are no-ops
        session.close();
    }

    #[test]
    fn test_observer_disconnect_keeps_driving() {
        let ctx = context();
        let observer = CommandSession::open(Arc::clone(&ctx), peer(1));
        let controller = CommandSession::open(Arc::clone(&ctx), peer(2));
        reply(&controller, r#"{"action":"FORWARD"}"#);
        drop(observer);
        assert!(!ctx.shared.command().is_stop());
        assert_eq!(ctx.registry.len(), 1);
    }
}
