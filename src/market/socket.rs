//! Realtime subscription driver for the marketplace event stream.
//!
//! The upstream multiplexes events over an Engine.IO-style transport that
//! splits connection establishment and delivery:
//!
//! 1. Long-poll handshake: `GET <base>/p2c-socket/?EIO=4&transport=polling`
//!    returns `0{"sid":...,"pingInterval":...,"pingTimeout":...}`.
//! 2. WebSocket upgrade to the same path with `transport=websocket&sid=<sid>`,
//!    followed by the probe sequence `2probe` → `3probe` → `5` → `40`.
//! 3. Steady state: numeric-prefixed text frames; `42[...]` frames carry the
//!    `list:snapshot` / `list:update` events that feed the virtual list.
//!
//! One driver call is one connection. Any transport error or unexpected close
//! returns to the caller; the worker supervisor owns the redial policy.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::error::MarketError;
use super::types::{ListUpdate, LivePayment};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_SNAPSHOT: &str = "list:snapshot";
const EVENT_UPDATE: &str = "list:update";
/// How many raw frames to dump at debug level after each connect.
const RAW_FRAME_LOG_BUDGET: u32 = 20;

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Receiver for payments surfacing on the stream. Invocations are serialized
/// on the driver's read loop, in receive order for a single connection.
#[async_trait]
pub trait LiveHandler: Send {
    async fn on_add(&mut self, payment: LivePayment);
}

/// Run one subscription session until cancellation or a transport error.
pub async fn subscribe(
    shutdown: &CancellationToken,
    base_url: &str,
    access_token: &str,
    handler: &mut (dyn LiveHandler + Send),
) -> Result<(), MarketError> {
    let open = handshake(base_url, access_token).await?;
    let ws_url = websocket_url(base_url, &open.sid);
    let mut ws = connect(&ws_url, access_token).await?;
    tracing::info!(
        url = %ws_url,
        ping_interval_ms = open.ping_interval,
        "event stream connected"
    );

    let mut list = LiveList::new();
    let mut frame_count: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    frame_count += 1;
                    if frame_count <= RAW_FRAME_LOG_BUDGET {
                        tracing::debug!(frame = %text, "ws raw");
                    }
                    handle_frame(text.as_str(), &mut ws, &mut list, handler).await?;
                }
                Some(Ok(Message::Ping(data))) => {
                    ws.send(Message::Pong(data))
                        .await
                        .map_err(|e| MarketError::Transport(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(MarketError::Transport("websocket closed by server".into()));
                }
                Some(Ok(_)) => {} // Binary, Pong — ignore
                Some(Err(e)) => return Err(MarketError::Transport(e.to_string())),
                None => return Err(MarketError::Transport("websocket stream ended".into())),
            }
        }
    }
}

/// Dispatch one text frame by its numeric prefix.
async fn handle_frame(
    frame: &str,
    ws: &mut WsStream,
    list: &mut LiveList,
    handler: &mut (dyn LiveHandler + Send),
) -> Result<(), MarketError> {
    // Server ping; reply immediately, the server drives the interval.
    if frame == "2" {
        return ws
            .send(Message::Text("3".into()))
            .await
            .map_err(|e| MarketError::Transport(e.to_string()));
    }
    if frame == "3" {
        return Ok(());
    }
    // Namespace connect ack. Fresh connection: reset the local list and ask
    // for the initial snapshot.
    if frame.starts_with("40") {
        list.reset();
        return ws
            .send(Message::Text(r#"42["list:initialize"]"#.into()))
            .await
            .map_err(|e| MarketError::Transport(e.to_string()));
    }
    let Some(payload) = frame.strip_prefix("42") else {
        tracing::debug!(frame, "ws control frame");
        return Ok(());
    };

    let Some((event, data)) = parse_event(payload) else {
        return Ok(());
    };
    match event.as_str() {
        EVENT_SNAPSHOT => {
            if let Ok(snapshot) = serde_json::from_value::<Vec<LivePayment>>(data) {
                list.apply_snapshot(&snapshot, Instant::now());
                tracing::debug!(items = list.len(), "ws snapshot loaded");
            }
        }
        EVENT_UPDATE => {
            let Ok(updates) = serde_json::from_value::<Vec<ListUpdate>>(data) else {
                return Ok(());
            };
            for update in updates {
                apply_update(list, update, handler).await;
            }
        }
        _ => {}
    }
    Ok(())
}

async fn apply_update(
    list: &mut LiveList,
    update: ListUpdate,
    handler: &mut (dyn LiveHandler + Send),
) {
    match update.op.as_str() {
        "add" => {
            let Some(payment) = update.data else { return };
            list.apply_add(&payment.id, update.pos, Instant::now());
            handler.on_add(payment).await;
        }
        "remove" => match list.apply_remove(update.pos, Instant::now()) {
            Remove::Removed { id, ttl } => {
                tracing::debug!(
                    id,
                    ttl_ms = ttl.map(|t| t.as_millis() as i64).unwrap_or(-1),
                    "ws list remove"
                );
            }
            Remove::Desync => {
                tracing::warn!(pos = ?update.pos, len = list.len(), "ws list remove desync");
            }
        },
        _ => {}
    }
}

/// Parse an event frame payload `["name", <payload>]`.
fn parse_event(payload: &str) -> Option<(String, serde_json::Value)> {
    let mut arr: Vec<serde_json::Value> = serde_json::from_str(payload).ok()?;
    if arr.len() < 2 {
        return None;
    }
    let data = arr.remove(1);
    let event = arr.remove(0).as_str()?.to_string();
    Some((event, data))
}

// ---------------------------------------------------------------------------
// Virtual list
// ---------------------------------------------------------------------------

/// Local projection of the server's ordered payment list.
///
/// `remove` deltas identify their victim by position, so the order here must
/// track the server's exactly; the id list and the first-seen map move as one.
struct LiveList {
    ids: Vec<String>,
    first_seen: HashMap<String, Instant>,
}

enum Remove {
    Removed { id: String, ttl: Option<Duration> },
    Desync,
}

impl LiveList {
    fn new() -> Self {
        Self {
            ids: Vec::new(),
            first_seen: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.ids.clear();
        self.first_seen.clear();
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    /// Replace the whole list, preserving server order.
    fn apply_snapshot(&mut self, payments: &[LivePayment], now: Instant) {
        self.reset();
        for p in payments {
            self.ids.push(p.id.clone());
            self.first_seen.insert(p.id.clone(), now);
        }
    }

    /// Insert an id at the given position, suppressing a stale duplicate
    /// first so client and server order stay agreed.
    fn apply_add(&mut self, id: &str, pos: Option<i64>, now: Instant) {
        self.first_seen.entry(id.to_string()).or_insert(now);
        if let Some(existing) = self.ids.iter().position(|x| x == id) {
            self.ids.remove(existing);
        }
        let pos = pos.unwrap_or(0).clamp(0, self.ids.len() as i64) as usize;
        self.ids.insert(pos, id.to_string());
    }

    /// Resolve a positional remove to its id; out-of-range positions mean the
    /// local list has drifted from the server's.
    fn apply_remove(&mut self, pos: Option<i64>, now: Instant) -> Remove {
        let Some(pos) = pos else { return Remove::Desync };
        if pos < 0 || pos as usize >= self.ids.len() {
            return Remove::Desync;
        }
        let id = self.ids.remove(pos as usize);
        let ttl = self
            .first_seen
            .remove(&id)
            .map(|seen| now.duration_since(seen));
        Remove::Removed { id, ttl }
    }
}

// ---------------------------------------------------------------------------
// Connection establishment
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OpenPacket {
    #[serde(default)]
    sid: String,
    #[serde(rename = "pingInterval", default)]
    ping_interval: u64,
}

/// Phase 1: long-poll handshake returning the session id.
async fn handshake(base_url: &str, access_token: &str) -> Result<OpenPacket, MarketError> {
    let url = format!(
        "{}/p2c-socket/?EIO=4&transport=polling",
        base_url.trim_end_matches('/')
    );
    let client = reqwest::Client::builder()
        .timeout(HANDSHAKE_TIMEOUT)
        .build()
        .map_err(|e| MarketError::Transport(e.to_string()))?;

    let mut req = client
        .get(&url)
        .header("Origin", origin_of(base_url))
        .header("Pragma", "no-cache")
        .header("Cache-Control", "no-cache");
    if !access_token.is_empty() {
        req = req.header(
            reqwest::header::COOKIE,
            format!("access_token={access_token}"),
        );
    }

    let body = req.send().await?.text().await?;
    parse_open_packet(&body)
}

fn parse_open_packet(body: &str) -> Result<OpenPacket, MarketError> {
    let Some(json) = body.strip_prefix('0') else {
        return Err(MarketError::Protocol(format!(
            "unexpected handshake body: {body}"
        )));
    };
    let open: OpenPacket = serde_json::from_str(json)
        .map_err(|e| MarketError::Protocol(format!("parse handshake: {e}")))?;
    if open.sid.is_empty() {
        return Err(MarketError::Protocol("empty sid in handshake".into()));
    }
    Ok(open)
}

fn websocket_url(base_url: &str, sid: &str) -> String {
    let base = base_url
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{base}/p2c-socket/?EIO=4&transport=websocket&sid={sid}")
}

fn origin_of(url: &str) -> String {
    let host = url
        .split("://")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or_default();
    format!("https://{host}")
}

/// Phase 2: WebSocket upgrade plus the Engine.IO probe sequence.
async fn connect(ws_url: &str, access_token: &str) -> Result<WsStream, MarketError> {
    let mut request = tungstenite::http::Request::builder()
        .uri(ws_url)
        .header(
            "Host",
            ws_url
                .split("://")
                .nth(1)
                .and_then(|s| s.split('/').next())
                .unwrap_or_default(),
        )
        .header("Origin", origin_of(ws_url))
        .header("Pragma", "no-cache")
        .header("Cache-Control", "no-cache")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        );
    if !access_token.is_empty() {
        request = request.header("Cookie", format!("access_token={access_token}"));
    }
    let request = request
        .body(())
        .map_err(|e| MarketError::Protocol(format!("build ws request: {e}")))?;

    let (mut ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| MarketError::Transport(format!("ws dial: {e}")))?;

    ws.send(Message::Text("2probe".into()))
        .await
        .map_err(|e| MarketError::Transport(e.to_string()))?;
    match ws.next().await {
        Some(Ok(Message::Text(text))) if text.as_str() == "3probe" => {}
        Some(Ok(msg)) => {
            return Err(MarketError::Protocol(format!("probe failed: {msg:?}")));
        }
        Some(Err(e)) => return Err(MarketError::Transport(e.to_string())),
        None => return Err(MarketError::Transport("ws closed during probe".into())),
    }
    ws.send(Message::Text("5".into()))
        .await
        .map_err(|e| MarketError::Transport(e.to_string()))?;
    // Connect to the default namespace.
    ws.send(Message::Text("40".into()))
        .await
        .map_err(|e| MarketError::Transport(e.to_string()))?;

    Ok(ws)
}
