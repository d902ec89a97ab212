// Passive zenoh mirror of the control snapshot and runtime health
// Nothing here can command the robot; it only publishes.

use std::sync::Arc;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::config::{TOPIC_HEALTH, TOPIC_VELOCITY};
use crate::runtime::RuntimeContext;
use crate::telemetry::velocity_message;

pub async fn run(ctx: Arc<RuntimeContext>) {
    if let Err(e) = publish(ctx).await {
        warn!("Zenoh mirror stopped: {}", e);
    }
}

async fn publish(ctx: Arc<RuntimeContext>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let pub_velocity = session.declare_publisher(TOPIC_VELOCITY).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    info!("Mirroring to: {}, {}", TOPIC_VELOCITY, TOPIC_HEALTH);

    let mut tick = interval(ctx.config.velocity_period());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;

        let velocity_json = velocity_message(&ctx.shared.snapshot()).to_json()?;
        pub_velocity.put(velocity_json).await?;

        let health_json = serde_json::to_string(&ctx.watchdog.health())?;
        pub_health.put(health_json).await?;
    }
}
