// Per-session telemetry publishers
//
// Two independent periodic tasks per session: host health every few seconds
// and the velocity/duty snapshot at ~10 Hz. Both read copies of shared state
// and push into the session's outbound queue; neither touches the actuation
// thread. A closed queue means the connection is gone and the task ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use crate::messages::Outbound;
use crate::runtime::RuntimeContext;
use crate::session::SessionId;
use crate::shared::ControlSnapshot;

pub struct TelemetryTasks {
    status: JoinHandle<()>,
    velocity: JoinHandle<()>,
}

impl TelemetryTasks {
    pub fn spawn(ctx: Arc<RuntimeContext>, session: SessionId, tx: mpsc::Sender<Outbound>) -> Self {
        let status = tokio::spawn(send_status_periodically(
            Arc::clone(&ctx),
            session,
            tx.clone(),
            ctx.config.health_interval(),
        ));
        let velocity = tokio::spawn(send_velocity_periodically(
            Arc::clone(&ctx),
            session,
            tx,
            ctx.config.velocity_period(),
        ));
        Self { status, velocity }
    }

    /// Cancel both tasks. Only this session's tasks are affected.
    pub fn cancel(self) {
        self.status.abort();
        self.velocity.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished() && self.velocity.is_finished()
    }
}

pub fn velocity_message(snapshot: &ControlSnapshot) -> Outbound {
    Outbound::velocity(snapshot.smoothed, snapshot.duty.current_l, snapshot.duty.current_r)
}

async fn send_status_periodically(
    ctx: Arc<RuntimeContext>,
    session: SessionId,
    tx: mpsc::Sender<Outbound>,
    period: Duration,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if tx.is_closed() {
            break;
        }
        let report = ctx.health_report().await;
        if tx.send(Outbound::status(report)).await.is_err() {
            break;
        }
    }
    debug!("Session {}: status telemetry stopped", session);
}

async fn send_velocity_periodically(
    ctx: Arc<RuntimeContext>,
    session: SessionId,
    tx: mpsc::Sender<Outbound>,
    period: Duration,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let snapshot = ctx.shared.snapshot();
        match tx.try_send(velocity_message(&snapshot)) {
            Ok(()) => {}
            // Slow link: drop this frame, the next one is fresher anyway
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!("Session {}: velocity telemetry stopped", session);
}
