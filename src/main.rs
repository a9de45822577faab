use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use marketmaker_arena::config;
use marketmaker_arena::gateway::Gateway;
use marketmaker_arena::registry::GameRegistry;
use marketmaker_arena::supervisor::Supervisor;
use marketmaker_arena::transport::inprocess::InProcessTransport;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let port = config::port();
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!("market-making arena listening on ws://{addr}");

    let transport = Arc::new(InProcessTransport::new());
    let registry = Arc::new(GameRegistry::new());
    let supervisor = Supervisor::new();
    let gateway = Gateway::new(registry, transport.clone(), supervisor);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };

        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let transport = transport.clone();
        let gateway = gateway.clone();

        tokio::spawn(async move {
            if let Err(e) = accept_and_serve(stream, conn_id, peer_addr, transport, gateway).await {
                warn!("connection {conn_id} from {peer_addr} failed: {e}");
            }
        });
    }
}

async fn accept_and_serve(
    stream: TcpStream,
    conn_id: u64,
    peer_addr: std::net::SocketAddr,
    transport: Arc<InProcessTransport>,
    gateway: Arc<Gateway>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let origins = config::cors_origins();
    let origin_check = move |req: &Request, response: Response| {
        let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
        if config::origin_allowed(&origins, origin) {
            Ok(response)
        } else {
            Err(tokio_tungstenite::tungstenite::http::Response::builder()
                .status(403)
                .body(None)
                .unwrap())
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, origin_check).await?;
    info!("connection {conn_id} from {peer_addr}");

    gateway.on_connect(conn_id);
    let rx = transport.register(conn_id);
    handle_connection(ws_stream, conn_id, gateway.clone(), rx).await;
    gateway.on_disconnect(conn_id).await;
    info!("connection {conn_id} closed");
    Ok(())
}

/// One WebSocket connection: read frames -> gateway dispatch, gateway
/// broadcasts/acks -> write frames. Mirrors the split read/write task shape
/// used for the game server's own per-socket plumbing.
async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    conn_id: u64,
    gateway: Arc<Gateway>,
    mut outbound_rx: mpsc::UnboundedReceiver<marketmaker_arena::transport::OutboundEvent>,
) {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_read.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
                warn!(conn_id, "malformed inbound frame, ignoring");
                continue;
            };
            let Some(event) = envelope.get("event").and_then(Value::as_str) else {
                continue;
            };
            let payload = envelope.get("payload").cloned().unwrap_or(Value::Null);
            let ack_id = envelope.get("id").cloned();

            let now_ms = now_millis();
            let ack = gateway.handle_event(conn_id, event, payload, now_ms).await;
            if let Some(id) = ack_id {
                gateway.send_ack(conn_id, id, ack);
            }
        }
    });

    let write_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let frame = json!({ "event": outbound.event, "payload": outbound.payload }).to_string();
            if ws_write.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = read_task => {}
        _ = write_task => {}
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
