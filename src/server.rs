// WebSocket command server
//
// Each accepted connection gets a CommandSession, its own outbound queue
// drained by a writer task, and its own telemetry tasks. Replies and
// telemetry share the queue, so a single writer owns the socket sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::messages::Outbound;
use crate::runtime::{RuntimeContext, RuntimeError};
use crate::session::CommandSession;
use crate::telemetry::TelemetryTasks;

// Outbound frames queued per session before velocity updates start dropping
const OUTBOUND_QUEUE: usize = 64;

/// Accept connections until the listener fails hard
pub async fn serve(listener: TcpListener, ctx: Arc<RuntimeContext>) -> Result<(), RuntimeError> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        warn!("Client {} error: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<RuntimeContext>) -> Result<(), WsError> {
    let ws_stream = accept_async(stream).await?;
    let (ws_tx, ws_rx) = ws_stream.split();
    run_session(ws_tx, ws_rx, peer, ctx).await
}

/// Drive one session until the peer closes, the read side errors, or the
/// writer can no longer deliver. The motors are stopped on every exit.
async fn run_session<S, R>(ws_tx: S, mut ws_rx: R, peer: SocketAddr, ctx: Arc<RuntimeContext>) -> Result<(), WsError>
where
    S: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut session = CommandSession::open(Arc::clone(&ctx), peer);
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let telemetry = TelemetryTasks::spawn(Arc::clone(&ctx), session.id(), tx.clone());
    let mut writer = tokio::spawn(write_outbound(ws_tx, rx));

    let result = loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = session.handle_text(text.as_str());
                    if tx.send(reply).await.is_err() {
                        break Ok(());
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Session {}: ignoring binary frame", session.id());
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e),
            },
            _ = &mut writer => {
                debug!("Session {}: writer ended", session.id());
                break Ok(());
            }
        }
    };

    // Stop first, then tear down telemetry and the socket
    session.close();
    telemetry.cancel();
    drop(tx);
    writer.abort();
    info!("Connection from {} closed", peer);
    result
}

async fn write_outbound<S>(mut ws_tx: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };
        if ws_tx.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}
