// Keyboard teleop: WASD move, space stop, [/] max duty, P ping, Q quit
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

const DUTY_STEPS: [u32; 5] = [40, 55, 70, 85, 100];
const INPUT_TIMEOUT_MS: u64 = 250; // Stop after this much time with no movement key

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(about = "Keyboard teleop for the rover command server")]
struct Args {
    /// WebSocket URL of the command server
    #[arg(default_value = "ws://127.0.0.1:9000")]
    url: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    info!("Connecting to {}...", args.url);
    let (ws, _) = connect_async(args.url.as_str()).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Text(text) = msg {
                // Velocity updates arrive at 10 Hz, only show the rest
                if !text.as_str().contains("\"head\"") {
                    info!("<- {}", text.as_str());
                }
            }
        }
        warn!("Connection closed by server");
    });

    info!("Controls: WASD=move, SPACE=stop, [/]=max duty, P=ping, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&mut ws_tx).await;
    disable_raw_mode()?;

    let _ = send(&mut ws_tx, json!({ "action": "DRIVE_STOP" })).await;
    let _ = ws_tx.close().await;
    reader.abort();
    result
}

async fn run_teleop(ws_tx: &mut WsSink) -> Result<(), BoxError> {
    let mut duty_idx = DUTY_STEPS.len() - 1;
    let mut moving: Option<&'static str> = None;
    let mut last_movement_input = Instant::now();

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                let motion = match code {
                    KeyCode::Char('w') if pressed => Some("FORWARD"),
                    KeyCode::Char('s') if pressed => Some("REVERSE"),
                    KeyCode::Char('a') if pressed => Some("LEFT"),
                    KeyCode::Char('d') if pressed => Some("RIGHT"),
                    _ => None,
                };
                if let Some(action) = motion {
                    last_movement_input = Instant::now();
                    // Repeats of the held key are not resent
                    if moving != Some(action) {
                        send(ws_tx, json!({ "action": action })).await?;
                        moving = Some(action);
                    }
                    continue;
                }

                match code {
                    KeyCode::Char(' ') if pressed => {
                        send(ws_tx, json!({ "action": "DRIVE_STOP" })).await?;
                        moving = None;
                    }
                    KeyCode::Char('[') if pressed => {
                        duty_idx = duty_idx.saturating_sub(1);
                        send_duty(ws_tx, duty_idx).await?;
                        moving = None;
                    }
                    KeyCode::Char(']') if pressed => {
                        duty_idx = (duty_idx + 1).min(DUTY_STEPS.len() - 1);
                        send_duty(ws_tx, duty_idx).await?;
                        moving = None;
                    }
                    KeyCode::Char('p') if pressed => {
                        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64;
                        send(ws_tx, json!({ "action": "PING", "timestamp": now })).await?;
                    }
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,
                    _ => {}
                }
            }
        }

        if moving.is_some() && last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            send(ws_tx, json!({ "action": "DRIVE_STOP" })).await?;
            moving = None;
        }
    }

    Ok(())
}

async fn send_duty(ws_tx: &mut WsSink, idx: usize) -> Result<(), BoxError> {
    let max = DUTY_STEPS[idx];
    info!("Max duty: {}%", max);
    send(ws_tx, json!({ "action": format!("SET_DUTY {} {}", DUTY_STEPS[0], max) })).await
}

async fn send(ws_tx: &mut WsSink, cmd: serde_json::Value) -> Result<(), BoxError> {
    ws_tx.send(Message::Text(cmd.to_string().into())).await?;
    Ok(())
}
