use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rover_drive_runtime::config::RuntimeConfig;
use rover_drive_runtime::motor::{Side, SimOutput};
use rover_drive_runtime::runtime::Robot;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_robot() -> (Arc<Robot>, SimOutput, String) {
    let sim = SimOutput::new();
    let config = RuntimeConfig {
        simulate: true,
        ..Default::default()
    };
    let robot = Arc::new(Robot::start(config, Box::new(sim.clone())).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let serving = Arc::clone(&robot);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (robot, sim, url)
}

async fn send(client: &mut Client, msg: Value) {
    client.send(Message::Text(msg.to_string().into())).await.unwrap();
}

/// Read frames until one matches, skipping telemetry
async fn recv_until(client: &mut Client, pred: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = client.next().await.unwrap().unwrap();
            if let Message::Text(text) = frame {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if pred(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap()
}

async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drive_ping_and_disconnect_stop() {
    let (robot, sim, url) = start_robot().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    send(&mut client, json!({"action": "forward"})).await;
    let ack = recv_until(&mut client, |v| v["status"] == "ok").await;
    assert_eq!(ack["command"], "FORWARD");
    let left = ack["velocities"]["left"].as_f64().unwrap();
    assert!((left - 0.5 / 0.065).abs() < 1e-3);

    // The ramp starts at the deadzone floor on the next tick
    wait_for(|| sim.last_duty(Side::Left).is_some_and(|d| d >= 40.0)).await;

    send(&mut client, json!({"action": "PING", "timestamp": 1712345678901u64})).await;
    let pong = recv_until(&mut client, |v| v["action"] == "PONG").await;
    assert_eq!(pong["timestamp"], 1712345678901u64);

    let update = recv_until(&mut client, |v| {
        v["head"] == "velocity_update" && v["l"].as_f64().is_some_and(|l| l > 0.0)
    })
    .await;
    assert!(update["vel"]["v"].as_f64().unwrap() > 0.0);

    client.close(None).await.unwrap();
    let ctx = Arc::clone(robot.context());
    wait_for(|| ctx.shared.command().is_stop()).await;
    wait_for(|| ctx.registry.is_empty()).await;
    wait_for(|| sim.last_duty(Side::Left) == Some(0.0) && sim.last_duty(Side::Right) == Some(0.0)).await;

    assert!(robot.lifecycle().emergency_stop());
    wait_for(|| sim.is_released()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abrupt_drop_stops_motors() {
    let (robot, sim, url) = start_robot().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    send(&mut client, json!({"action": "REVERSE"})).await;
    recv_until(&mut client, |v| v["command"] == "REVERSE").await;
    wait_for(|| sim.last_duty(Side::Left).is_some_and(|d| d > 0.0)).await;

    // No close frame, the socket just goes away
    drop(client);

    let ctx = Arc::clone(robot.context());
    wait_for(|| ctx.registry.is_empty()).await;
    assert!(ctx.shared.command().is_stop());
    wait_for(|| sim.last_duty(Side::Left) == Some(0.0) && sim.last_duty(Side::Right) == Some(0.0)).await;

    robot.lifecycle().emergency_stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_newest_connection_takes_control() {
    let (robot, _sim, url) = start_robot().await;
    let ctx = Arc::clone(robot.context());
    let (mut old, _) = connect_async(url.as_str()).await.unwrap();
    wait_for(|| ctx.registry.len() == 1).await;

    send(&mut old, json!({"action": "FORWARD"})).await;
    recv_until(&mut old, |v| v["command"] == "FORWARD").await;

    let (mut new, _) = connect_async(url.as_str()).await.unwrap();
    wait_for(|| ctx.registry.len() == 2).await;

    // The old link can no longer drive, but can still stop
    send(&mut old, json!({"action": "LEFT"})).await;
    let denied = recv_until(&mut old, |v| v["status"] == "error").await;
    assert_eq!(denied["msg"], "Session is not the controller");
    send(&mut old, json!({"action": "DRIVE_STOP"})).await;
    recv_until(&mut old, |v| v["command"] == "DRIVE_STOP").await;
    assert!(ctx.shared.command().is_stop());

    send(&mut new, json!({"action": "SET_DUTY 30 90"})).await;
    let ack = recv_until(&mut new, |v| v["command"] == "SET_DUTY").await;
    assert_eq!(ack["duty_limits"], json!({"min": 30.0, "max": 90.0}));

    send(&mut new, json!({"action": "LEFT"})).await;
    recv_until(&mut new, |v| v["command"] == "LEFT").await;
    assert_eq!(ctx.shared.command().target_duty, 90.0);

    // The old session leaving keeps the robot moving
    old.close(None).await.unwrap();
    wait_for(|| ctx.registry.len() == 1).await;
    assert!(!ctx.shared.command().is_stop());

    send(&mut new, json!({"action": "bogus"})).await;
    let err = recv_until(&mut new, |v| v["status"] == "error").await;
    assert_eq!(err["msg"], "Invalid command");
    assert!(!ctx.shared.command().is_stop());

    robot.lifecycle().emergency_stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_motion_refused_after_emergency_stop() {
    let (robot, sim, url) = start_robot().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    let ctx = Arc::clone(robot.context());
    wait_for(|| ctx.registry.len() == 1).await;

    robot.lifecycle().emergency_stop();
    wait_for(|| sim.is_released()).await;

    send(&mut client, json!({"action": "FORWARD"})).await;
    let reply = recv_until(&mut client, |v| v.get("status").is_some()).await;
    assert_eq!(reply["status"], "error");
    assert!(ctx.shared.command().is_stop());
}
