// Process wiring: actuation thread, command server, watchdog, shutdown
// Note: the watchdog is optional here. The operator GUI sends one command per
// key press, so a short timeout would stop the robot while a key is held.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{ConfigError, RuntimeConfig};
use crate::control::ControlLoop;
use crate::health::{self, HealthReport};
use crate::messages::RuntimeHealth;
use crate::motor::{
    ActuationController, DriveGeometry, DutyLimits, MotorOutput, OutputError, SimOutput, VelocitySmoother,
};
use crate::safety::{Lifecycle, install_panic_hook};
use crate::session::{CommandLog, SessionRegistry};
use crate::shared::{ControlShared, LoopState};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Motor output error: {0}")]
    Output(#[from] OutputError),

    #[error("Built without GPIO support; rebuild with --features gpio or run with --sim")]
    NoHardware,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Failed to start actuation thread: {0}")]
    Spawn(std::io::Error),

    #[error("Hardware fault: {0}")]
    Hardware(String),

    #[error("Actuation loop halted while serving")]
    Halted,
}

struct WatchdogState {
    cmd_received_at: Option<Instant>,
    moving: bool,
}

/// Tracks the age of the last motion command
pub struct CommandWatchdog {
    timeout: Option<Duration>,
    state: Mutex<WatchdogState>,
}

impl CommandWatchdog {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            state: Mutex::new(WatchdogState {
                cmd_received_at: None,
                moving: false,
            }),
        }
    }

    pub fn on_command(&self, moving: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.cmd_received_at = Some(Instant::now());
        state.moving = moving;
    }

    /// Returns `true` once when a moving robot's command goes stale
    pub fn check(&self) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = state
            .cmd_received_at
            .is_some_and(|at| at.elapsed() > timeout);
        if stale && state.moving {
            state.moving = false;
            return true;
        }
        false
    }

    pub fn health(&self) -> RuntimeHealth {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match (state.cmd_received_at, self.timeout) {
            // Stale until the first command arrives
            (None, _) => RuntimeHealth::CmdStale,
            (Some(at), Some(timeout)) if at.elapsed() > timeout => RuntimeHealth::CmdStale,
            _ => RuntimeHealth::Ok,
        }
    }
}

pub struct RuntimeContext {
    pub config: RuntimeConfig,
    pub shared: Arc<ControlShared>,
    pub registry: SessionRegistry,
    pub log: CommandLog,
    pub watchdog: CommandWatchdog,
    pub geometry: DriveGeometry,
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig, shared: Arc<ControlShared>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            log: CommandLog::new(config.command_log_capacity),
            watchdog: CommandWatchdog::new(config.cmd_timeout()),
            geometry: DriveGeometry::new(config.wheel_base, config.wheel_radius),
            config,
            shared,
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        let (throttle, cpu_temp_c, load_avg_1m) =
            tokio::join!(health::read_throttle(), health::read_cpu_temp(), health::read_loadavg());
        HealthReport {
            throttle,
            cpu_temp_c,
            load_avg_1m,
            runtime_health: self.watchdog.health(),
            sessions: self.registry.len(),
            commands_in_window: self.log.len(),
            last_command: self.log.last().map(|entry| entry.action),
        }
    }
}

/// A running actuation thread plus everything sessions need to reach it
pub struct Robot {
    ctx: Arc<RuntimeContext>,
    lifecycle: Arc<Lifecycle>,
    control: Option<JoinHandle<()>>,
}

impl Robot {
    /// Start the actuation thread on `output`
    pub fn start(config: RuntimeConfig, output: Box<dyn MotorOutput>) -> Result<Self, RuntimeError> {
        let config = config.sanitized();
        let shared = Arc::new(ControlShared::new(DutyLimits::new(config.min_duty, config.max_duty)));

        let actuation = ActuationController::new(output, config.update_hz, config.ramp_time_s)
            .with_trim(config.trim_left, config.trim_right);
        let control = ControlLoop::new(
            Arc::clone(&shared),
            actuation,
            VelocitySmoother::new(config.max_accel, config.max_ang_accel, config.update_hz),
            DriveGeometry::new(config.wheel_base, config.wheel_radius),
            config.tick_period(),
        );
        let handle = control.spawn().map_err(RuntimeError::Spawn)?;

        let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&shared), config.tick_period()));
        let ctx = Arc::new(RuntimeContext::new(config, shared));

        Ok(Self {
            ctx,
            lifecycle,
            control: Some(handle),
        })
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Accept sessions on `listener` until the listener fails or the
    /// actuation loop stops, whether by fault or by an emergency stop.
    /// Also runs the command watchdog.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RuntimeError> {
        let watchdog = tokio::spawn(run_watchdog(Arc::clone(&self.ctx)));
        let mut loop_state = self.ctx.shared.subscribe_loop_state();

        let result = tokio::select! {
            result = crate::server::serve(listener, Arc::clone(&self.ctx)) => result,
            err = wait_for_loop_exit(&mut loop_state) => Err(err),
        };
        watchdog.abort();
        result
    }

    /// Stop the motors, release the hardware and join the actuation thread
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.lifecycle.emergency_stop();
        if let Some(handle) = self.control.take() {
            if handle.join().is_err() {
                error!("Actuation thread panicked");
            }
        }
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

async fn wait_for_loop_exit(rx: &mut watch::Receiver<LoopState>) -> RuntimeError {
    loop {
        let state = rx.borrow_and_update().clone();
        match state {
            LoopState::Running => {}
            LoopState::Halted => return RuntimeError::Halted,
            LoopState::Faulted(reason) => return RuntimeError::Hardware(reason),
        }
        if rx.changed().await.is_err() {
            // Sender lives in the shared state for the whole process
            std::future::pending::<()>().await;
        }
    }
}

async fn run_watchdog(ctx: Arc<RuntimeContext>) {
    if ctx.config.cmd_timeout().is_none() {
        return;
    }
    let mut tick = interval(ctx.config.velocity_period());
    loop {
        tick.tick().await;
        if ctx.watchdog.check() {
            warn!("Command stale, stopping robot");
            ctx.shared.stop();
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn open_output(config: &RuntimeConfig) -> Result<Box<dyn MotorOutput>, RuntimeError> {
    if config.simulate {
        info!("Motor output: simulation");
        return Ok(Box::new(SimOutput::new()));
    }
    open_hardware(config)
}

#[cfg(feature = "gpio")]
fn open_hardware(config: &RuntimeConfig) -> Result<Box<dyn MotorOutput>, RuntimeError> {
    info!("Motor output: GPIO");
    let output = crate::motor::GpioOutput::open(&config.pins, config.pwm_freq_hz)?;
    Ok(Box::new(output))
}

#[cfg(not(feature = "gpio"))]
fn open_hardware(_config: &RuntimeConfig) -> Result<Box<dyn MotorOutput>, RuntimeError> {
    Err(RuntimeError::NoHardware)
}

pub async fn run(config: RuntimeConfig) -> Result<(), RuntimeError> {
    let output = open_output(&config)?;
    let robot = Robot::start(config, output)?;
    install_panic_hook(Arc::clone(robot.lifecycle()));

    let config = robot.context().config.clone();
    let addr = format!("{}:{}", config.bind_addr, config.cmd_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(source) => {
            robot.shutdown();
            return Err(RuntimeError::Bind { addr, source });
        }
    };
    let local: Option<SocketAddr> = listener.local_addr().ok();

    info!(
        "Runtime started: {}Hz actuation, {:.2}s ramp, duty {}..{}%",
        config.update_hz, config.ramp_time_s, config.min_duty, config.max_duty
    );
    info!("Command WebSocket listening on {}", local.map_or(addr, |a| a.to_string()));
    if let Some(timeout) = config.cmd_timeout() {
        info!("Command watchdog: {}ms", timeout.as_millis());
    }

    let mirror = if config.zenoh_mirror {
        Some(tokio::spawn(crate::mirror::run(Arc::clone(robot.context()))))
    } else {
        None
    };

    let result = tokio::select! {
        result = robot.serve(listener) => result,
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    if let Some(mirror) = mirror {
        mirror.abort();
    }
    robot.shutdown();
    result
}
