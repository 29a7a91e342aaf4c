use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::agent::AgentRuntime;
use crate::config::ServerConfig;
use crate::event_bridge::ObserverEvent;
use crate::gateway::ActionGateway;
use crate::session::ObserverSession;

const INVALID_INPUT_MESSAGE: &str = "Invalid input format";

#[derive(Debug, Deserialize)]
struct InboundTask {
    input: String,
}

/// WebSocket endpoint observers connect to. Each connection gets its own
/// [`ObserverSession`]; the gateway and agent runtime are shared.
pub struct ObserverServer {
    settings: ServerConfig,
    gateway: Arc<ActionGateway>,
    runtime: Arc<dyn AgentRuntime>,
}

impl ObserverServer {
    pub fn new(
        settings: ServerConfig,
        gateway: Arc<ActionGateway>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        Self {
            settings,
            gateway,
            runtime,
        }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.settings.bind)
            .await
            .with_context(|| {
                format!(
                    "failed binding observer listener on {}",
                    self.settings.bind
                )
            })?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("observer server listening on ws://{bound_addr}");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("observer server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let settings = self.settings.clone();
                            let gateway = Arc::clone(&self.gateway);
                            let runtime = Arc::clone(&self.runtime);
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, settings, gateway, runtime).await {
                                    warn!("observer connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("observer accept failed: {err}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    settings: ServerConfig,
    gateway: Arc<ActionGateway>,
    runtime: Arc<dyn AgentRuntime>,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let (mut write, mut read) = ws.split();
    info!("observer connected from {remote_addr}");

    let capacity = settings.event_queue_capacity.max(1);
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::channel::<ObserverEvent>(capacity);
    let frames = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if event.is_terminal() {
                debug!("run for {remote_addr} reached its terminal event");
            }
            if frames
                .send(Message::Text(event.to_frame().to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let session = ObserverSession::spawn(runtime, gateway, events_tx, settings.max_pending_tasks);

    while let Some(inbound) = read.next().await {
        let inbound = match inbound {
            Ok(message) => message,
            Err(err) => {
                debug!("observer {remote_addr} read error: {err}");
                break;
            }
        };
        match inbound {
            Message::Text(text) => {
                let task = match parse_task(&text) {
                    Some(task) => task,
                    None => {
                        debug!("rejecting malformed frame from {remote_addr}");
                        send_rejection(&out_tx, INVALID_INPUT_MESSAGE).await;
                        continue;
                    }
                };
                if let Err(err) = session.submit(task) {
                    warn!("observer {remote_addr} task rejected: {err}");
                    send_rejection(&out_tx, &err.to_string()).await;
                }
            }
            Message::Binary(_) => send_rejection(&out_tx, INVALID_INPUT_MESSAGE).await,
            Message::Ping(payload) => {
                let _ = out_tx.try_send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    drop(session);
    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    info!("observer {remote_addr} disconnected");
    Ok(())
}

fn parse_task(text: &str) -> Option<String> {
    let task = serde_json::from_str::<InboundTask>(text).ok()?;
    if task.input.trim().is_empty() {
        return None;
    }
    Some(task.input)
}

/// Refuses one inbound frame without touching the run in flight.
async fn send_rejection(out_tx: &mpsc::Sender<Message>, message: &str) {
    let frame = ObserverEvent::rejection(message).to_frame();
    let _ = out_tx.send(Message::Text(frame.to_string())).await;
}
