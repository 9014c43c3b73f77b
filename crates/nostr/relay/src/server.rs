//! WebSocket server for handling client connections
//!
//! Accepts WebSocket connections and drives one [`Connection`] per client.
//! Each connection task selects between frames from the socket and frames
//! queued in its outbox by live fan-out. Two background tasks run beside the
//! accept loop: the bus listener and the expiry sweep.

use crate::connection::{Connection, RelayContext};
use crate::error::{RelayError, Result};
use crate::message::RelayMessage;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Nostr relay server
pub struct RelayServer {
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.ctx.server_config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("relay server listening on {}", listener.local_addr()?);

        let interval = Duration::from_secs(self.ctx.server_config().expiry_sweep_interval_secs.max(1));
        let _bus_task = spawn_bus_listener(Arc::clone(&self.ctx));
        let _sweep_task = spawn_expiry_sweep(Arc::clone(&self.ctx), interval);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("new connection from {}", addr);
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx).await {
                            debug!("connection {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: Arc<RelayContext>) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| RelayError::WebSocket(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(ctx.server_config().outbox_capacity.max(1));

    let mut connection = Connection::new(ctx, addr.to_string());
    for frame in connection.open(outbox_tx) {
        write
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| RelayError::WebSocket(e.to_string()))?;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for frame in connection.handle_text(text.as_str()).await {
                            if let Err(e) = write.send(Message::Text(frame.into())).await {
                                warn!("failed to send response to {}: {}", addr, e);
                                connection.close();
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let notice = RelayMessage::Notice("invalid: binary frames are not supported").to_json();
                        let _ = write.send(Message::Text(notice.into())).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("websocket error from {}: {}", addr, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = outbox_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    debug!("failed to deliver event to {}: {}", addr, e);
                    break;
                }
            }
        }
    }

    connection.close();
    Ok(())
}

/// Deliver events accepted by sibling instances to local subscribers.
pub fn spawn_bus_listener(ctx: Arc<RelayContext>) -> JoinHandle<()> {
    let mut rx = ctx.bus().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    ctx.receive(&envelope, crate::unix_now());
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("bus listener lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("bus closed");
                    break;
                }
            }
        }
    })
}

/// Physically remove expired events on a fixed interval.
pub fn spawn_expiry_sweep(ctx: Arc<RelayContext>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let store = Arc::clone(ctx.store());
            let now = crate::unix_now();
            match tokio::task::spawn_blocking(move || store.purge_expired(now)).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => info!(removed, "expiry sweep"),
                Ok(Err(e)) => warn!("expiry sweep failed: {}", e),
                Err(e) => warn!("expiry sweep task failed: {}", e),
            }
        }
    })
}
