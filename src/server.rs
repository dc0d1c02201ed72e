//! WebSocket endpoint.
//!
//! One persistent socket per client. Text messages are control commands and
//! get exactly one text reply each; binary messages from the server are JPEG
//! frames. Each connection runs a reader loop that feeds its [`Dispatcher`]
//! and a writer task draining the outbound queue shared by replies and
//! streaming tasks.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::camera::CameraFamily;
use crate::config::ServiceConfig;
use crate::dispatcher::{Dispatcher, ServiceContext};
use crate::error::{AppResult, ServiceError};
use crate::streaming::Outbound;

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    ctx: Arc<ServiceContext>,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl AppState {
    /// State admitting at most `max_connections` concurrent clients.
    pub fn new(ctx: Arc<ServiceContext>, max_connections: usize) -> Self {
        Self {
            ctx,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Number of connected clients.
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }
}

/// Routes: the socket is accepted on `/` and `/ws`, `/health` reports load.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.active_connections(),
        "max_connections": state.max_connections,
        "claimed_devices": state.ctx.claims.len(),
    }))
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Ok(permit) = Arc::clone(&state.slots).try_acquire_owned() else {
        warn!(max = state.max_connections, "Connection limit reached, rejecting client");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, state.ctx, permit))
}

async fn handle_websocket(
    socket: WebSocket,
    ctx: Arc<ServiceContext>,
    permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4();
    let span = tracing::info_span!("connection", id = %connection_id);
    let (sender, receiver) = socket.split();
    drive_connection(ctx, sender, receiver)
        .instrument(span)
        .await;
    drop(permit);
}

/// Runs one client connection to completion.
///
/// Returns once the client closes, the socket fails, or the writer can no
/// longer deliver. Every session the client opened is torn down before this
/// returns.
pub async fn drive_connection<Tx, Rx, E>(ctx: Arc<ServiceContext>, sender: Tx, mut receiver: Rx)
where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let (outbound, queue) = mpsc::channel(ctx.streaming.outbound_queue);
    let writer = tokio::spawn(write_outbound(sender, queue));
    let mut dispatcher = Dispatcher::new(ctx, outbound);
    info!("Client connected");

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match dispatcher.handle_text(text.as_str()).await {
                Ok(()) => {}
                Err(ServiceError::ConnectionClosed) => {
                    debug!("Writer gone, closing connection");
                    break;
                }
                Err(e) => warn!("Failed to handle message: {e}"),
            },
            Ok(Message::Binary(bytes)) => {
                debug!(len = bytes.len(), "Ignoring binary message from client");
            }
            Ok(Message::Close(_)) => {
                info!("Client closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error: {e}");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    drop(dispatcher);
    if let Err(e) = writer.await {
        warn!("Writer task failed: {e}");
    }
    info!("Client disconnected");
}

async fn write_outbound<Tx>(mut sender: Tx, mut queue: mpsc::Receiver<Outbound>)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    while let Some(item) = queue.recv().await {
        let message = match item {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Frame(bytes) => Message::Binary(bytes.into()),
        };
        if let Err(e) = sender.send(message).await {
            debug!("Socket send failed: {e}");
            break;
        }
    }
    let _ = sender.close().await;
}

/// Binds the configured address and serves until Ctrl-C.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn serve(config: &ServiceConfig) -> AppResult<()> {
    let ctx = Arc::new(ServiceContext::from_config(config));
    if !config.simulator.enabled {
        report_sdks(&ctx);
    }
    let state = AppState::new(ctx, config.server.max_connections);

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address).await?;
    info!(
        address = %listener.local_addr()?,
        max_connections = config.server.max_connections,
        "Camera service listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Camera service stopped");
    Ok(())
}

/// Logs which vendor SDKs are installed. Returns how many families are both
/// installed and bound to a driver.
fn report_sdks(ctx: &ServiceContext) -> usize {
    let availability: BTreeMap<CameraFamily, bool> =
        ctx.availability.check_availability().into_iter().collect();
    let mut ready = 0;
    for (family, installed) in &availability {
        match (installed, ctx.catalog.has_sdk(*family)) {
            (true, true) => ready += 1,
            (true, false) => warn!(%family, "SDK library found but no driver is registered"),
            (false, _) => debug!(%family, "SDK library not installed"),
        }
    }
    info!(?availability, ready, "Camera SDK availability");
    ready
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated::SimulatedSdk;
    use crate::camera::DriverCatalog;
    use crate::config::StreamingConfig;
    use crate::sdk::StaticAvailability;
    use futures::channel::mpsc as fmpsc;
    use serde_json::{json, Value};
    use std::convert::Infallible;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn context() -> Arc<ServiceContext> {
        Arc::new(ServiceContext::new(
            DriverCatalog::simulated(1, 64, 48),
            Arc::new(StaticAvailability::all()),
            StreamingConfig::default(),
        ))
    }

    fn text(value: Value) -> Result<Message, Infallible> {
        Ok(Message::Text(value.to_string().into()))
    }

    async fn next_text(rx: &mut fmpsc::UnboundedReceiver<Message>) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.next())
                .await
                .unwrap()
                .unwrap();
            if let Message::Text(t) = msg {
                return serde_json::from_str(t.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn replies_in_order_and_tears_down_on_close() {
        let ctx = context();
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, Infallible>>();

        let conn = tokio::spawn(drive_connection(Arc::clone(&ctx), out_tx, in_rx));

        let select = json!({"command": "select-family", "camera_type": "ids"});
        in_tx.unbounded_send(text(select)).unwrap();
        in_tx.unbounded_send(text(json!({"command": "connect", "index": 0}))).unwrap();
        in_tx.unbounded_send(Ok(Message::Binary(vec![1, 2, 3].into()))).unwrap();
        in_tx.unbounded_send(text(json!({"command": "get-current", "index": 0}))).unwrap();

        assert_eq!(next_text(&mut out_rx).await["command"], "select-family");
        assert_eq!(next_text(&mut out_rx).await["command"], "connect");
        assert_eq!(next_text(&mut out_rx).await["command"], "get-current");
        assert!(ctx.claims.is_claimed(CameraFamily::Ids, 0));

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        tokio::time::timeout(Duration::from_secs(3), conn).await.unwrap().unwrap();
        assert!(ctx.claims.is_empty());
    }

    #[tokio::test]
    async fn dropped_client_stops_streams() {
        let ctx = context();
        let (out_tx, mut out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, Infallible>>();
        let conn = tokio::spawn(drive_connection(Arc::clone(&ctx), out_tx, in_rx));

        let select = json!({"command": "select-family", "camera_type": "hikrobot"});
        in_tx.unbounded_send(text(select)).unwrap();
        in_tx.unbounded_send(text(json!({"command": "connect", "index": 0}))).unwrap();
        in_tx.unbounded_send(text(json!({"command": "start-stream", "index": 0}))).unwrap();
        next_text(&mut out_rx).await;
        next_text(&mut out_rx).await;
        assert_eq!(next_text(&mut out_rx).await["message"], "Stream started");

        drop(in_tx);
        tokio::time::timeout(Duration::from_secs(3), conn).await.unwrap().unwrap();
        assert!(ctx.claims.is_empty());
    }

    #[test]
    #[traced_test]
    fn startup_reports_sdk_availability() {
        let sdk = SimulatedSdk::for_family(CameraFamily::Ids, 1, 32, 32);
        let catalog = DriverCatalog::default().with_sdk(CameraFamily::Ids, Arc::new(sdk));
        let ctx = ServiceContext::new(
            catalog,
            Arc::new(StaticAvailability::all().with(CameraFamily::Mshot, false)),
            StreamingConfig::default(),
        );
        assert_eq!(report_sdks(&ctx), 1);
        assert!(logs_contain("Camera SDK availability"));
        assert!(logs_contain("SDK library found but no driver is registered"));
    }

    #[test]
    fn connection_slots() {
        let state = AppState::new(context(), 2);
        assert_eq!(state.active_connections(), 0);
        let _a = Arc::clone(&state.slots).try_acquire_owned().unwrap();
        let _b = Arc::clone(&state.slots).try_acquire_owned().unwrap();
        assert_eq!(state.active_connections(), 2);
        assert!(Arc::clone(&state.slots).try_acquire_owned().is_err());
    }
}
