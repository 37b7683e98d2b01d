//! Newline-delimited JSON over TCP.
//!
//! Each request line is an object tagged by `op`; each reply is a line tagged
//! by `type` (`ok` or `error`). Notifications for the users a connection
//! listens to arrive as `notification` lines in between replies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::{MAX_FRAME_LEN, MAX_LISTENS_PER_CONNECTION};
use crate::model::*;
use crate::notify::{send_test_notification, Notification, NotifyError, TemplateKind};
use crate::observability;
use crate::tenant::{Tenant, TenantManager};

pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Use {
        tenant: String,
    },
    CreateTrip {
        #[serde(default)]
        id: Option<Ulid>,
        rider_id: UserId,
    },
    GetTrip {
        id: Ulid,
    },
    UpdateTrip {
        id: Ulid,
        status: TripStatus,
        #[serde(default)]
        cancelled_by: Option<Party>,
    },
    CreateClaim {
        #[serde(default)]
        id: Option<Ulid>,
        trip_id: Ulid,
        driver_id: UserId,
    },
    GetClaim {
        id: Ulid,
    },
    ListClaims {
        trip_id: Ulid,
        #[serde(default)]
        status: Option<ClaimStatus>,
    },
    /// The driver's accept tap.
    Accept {
        claim_id: Ulid,
    },
    Listen {
        recipient: UserId,
    },
    Unlisten {
        recipient: UserId,
    },
    UnlistenAll,
    TestNotification {
        recipient: UserId,
        title: String,
        body: String,
        #[serde(default)]
        kind: Option<TemplateKind>,
        #[serde(default)]
        data: Map<String, Value>,
    },
}

/// One server-to-client line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Ok { result: Value },
    Error { code: String, message: String },
    Notification(Notification),
}

// ── Framing ──────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FrameError {
    TooLong { limit: usize },
    Encode(serde_json::Error),
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLong { limit } => write!(f, "line exceeds {limit} bytes"),
            FrameError::Encode(e) => write!(f, "encode: {e}"),
            FrameError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Splits input on `\n` (tolerating `\r\n`) and writes frames as one JSON
/// object per line. Blank lines are skipped.
#[derive(Debug)]
pub struct JsonLinesCodec {
    max_len: usize,
    /// How far into the buffer we already know there is no newline.
    scanned: usize,
}

impl JsonLinesCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
        }
    }
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            let Some(offset) = buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                if buf.len() > self.max_len {
                    return Err(FrameError::TooLong { limit: self.max_len });
                }
                self.scanned = buf.len();
                return Ok(None);
            };
            let end = self.scanned + offset;
            self.scanned = 0;
            if end > self.max_len {
                return Err(FrameError::TooLong { limit: self.max_len });
            }

            let mut line = buf.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line.freeze()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.scanned = 0;
        let rest = buf.split();
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(rest.freeze()))
    }
}

impl Encoder<Frame> for JsonLinesCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), FrameError> {
        serde_json::to_writer(BufMut::writer(&mut *buf), &frame).map_err(FrameError::Encode)?;
        buf.put_u8(b'\n');
        Ok(())
    }
}

// ── Request errors ───────────────────────────────────────────────

/// A failed request, as reported back to the client.
#[derive(Debug)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
}

impl WireError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<NotifyError> for WireError {
    fn from(e: NotifyError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::new("bad_request", e.to_string())
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

// ── Connection ───────────────────────────────────────────────────

struct Session {
    tenants: Arc<TenantManager>,
    tenant: Arc<Tenant>,
    tenant_name: String,
    listens: HashMap<UserId, JoinHandle<()>>,
    push_tx: mpsc::Sender<Notification>,
}

impl Session {
    async fn handle(&mut self, line: &[u8]) -> Frame {
        let started = Instant::now();
        let request: Request = match serde_json::from_slice(line) {
            Ok(request) => request,
            Err(e) => {
                metrics::counter!(
                    observability::REQUESTS_TOTAL,
                    "op" => "invalid",
                    "status" => "error"
                )
                .increment(1);
                return error_frame(WireError::from(e));
            }
        };
        let op = observability::op_label(&request);
        let result = self.execute(request).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status)
            .increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        match result {
            Ok(result) => Frame::Ok { result },
            Err(e) => {
                debug!("{op} failed: {e}");
                error_frame(e)
            }
        }
    }

    async fn execute(&mut self, request: Request) -> Result<Value, WireError> {
        let engine = &self.tenant.engine;
        match request {
            Request::Use { tenant } => {
                let next = self
                    .tenants
                    .get_or_create(&tenant)
                    .map_err(|e| WireError::new("tenant_error", e.to_string()))?;
                // Listens belong to the old tenant's hub.
                self.close_listens();
                self.tenant = next;
                self.tenant_name = tenant;
                Ok(json!({ "tenant": self.tenant_name }))
            }
            Request::CreateTrip { id, rider_id } => {
                let id = id.unwrap_or_else(Ulid::new);
                engine.create_trip(id, rider_id).await?;
                Ok(serde_json::to_value(engine.trip(&id).await.ok_or(EngineError::NotFound(id))?)?)
            }
            Request::GetTrip { id } => {
                Ok(serde_json::to_value(engine.trip(&id).await.ok_or(EngineError::NotFound(id))?)?)
            }
            Request::UpdateTrip { id, status, cancelled_by } => {
                engine.update_trip_status(id, status, cancelled_by).await?;
                Ok(serde_json::to_value(engine.trip(&id).await.ok_or(EngineError::NotFound(id))?)?)
            }
            Request::CreateClaim { id, trip_id, driver_id } => {
                let id = id.unwrap_or_else(Ulid::new);
                engine.create_claim(id, trip_id, driver_id).await?;
                Ok(serde_json::to_value(engine.claim(&id).await.ok_or(EngineError::NotFound(id))?)?)
            }
            Request::GetClaim { id } => {
                Ok(serde_json::to_value(engine.claim(&id).await.ok_or(EngineError::NotFound(id))?)?)
            }
            Request::ListClaims { trip_id, status } => {
                if engine.trip(&trip_id).await.is_none() {
                    return Err(EngineError::NotFound(trip_id).into());
                }
                Ok(serde_json::to_value(engine.claims_for_trip(&trip_id, status).await)?)
            }
            Request::Accept { claim_id } => {
                let status = engine.request_accept(claim_id).await?;
                Ok(json!({ "claim_id": claim_id, "status": status }))
            }
            Request::Listen { recipient } => {
                let full = self.listens.len() >= MAX_LISTENS_PER_CONNECTION;
                if full && !self.listens.contains_key(&recipient) {
                    return Err(WireError::new(
                        "limit_exceeded",
                        "too many listens on this connection",
                    ));
                }
                let rx = self.tenant.hub.subscribe(&recipient);
                let forwarder = forward(rx, self.push_tx.clone());
                if let Some(previous) = self.listens.insert(recipient.clone(), forwarder) {
                    previous.abort();
                }
                Ok(json!({ "listening": recipient }))
            }
            Request::Unlisten { recipient } => {
                let was_listening = match self.listens.remove(&recipient) {
                    Some(forwarder) => {
                        forwarder.abort();
                        true
                    }
                    None => false,
                };
                self.tenant.hub.prune();
                Ok(json!({ "unlistened": recipient, "was_listening": was_listening }))
            }
            Request::UnlistenAll => {
                let count = self.listens.len();
                self.close_listens();
                Ok(json!({ "unlistened": count }))
            }
            Request::TestNotification { recipient, title, body, kind, data } => {
                let hub = &*self.tenant.hub;
                let delivered =
                    send_test_notification(hub, &recipient, &title, &body, kind, data).await?;
                Ok(json!({ "delivered": delivered }))
            }
        }
    }

    fn close_listens(&mut self) {
        for (_, forwarder) in self.listens.drain() {
            forwarder.abort();
        }
        self.tenant.hub.prune();
    }
}

fn error_frame(e: WireError) -> Frame {
    Frame::Error { code: e.code.to_string(), message: e.message }
}

/// Copy one recipient's notifications onto the connection's push queue.
fn forward(
    mut rx: broadcast::Receiver<Notification>,
    tx: mpsc::Sender<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    if tx.send(notification).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("listener fell behind, {skipped} notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: S, tenants: Arc<TenantManager>) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tenant = tenants.get_or_create(DEFAULT_TENANT)?;
    let (push_tx, mut push_rx) = mpsc::channel(256);
    let mut session = Session {
        tenants,
        tenant,
        tenant_name: DEFAULT_TENANT.to_string(),
        listens: HashMap::new(),
        push_tx,
    };
    let mut framed = Framed::new(socket, JsonLinesCodec::default());

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(FrameError::TooLong { limit })) => {
                        let message = format!("line exceeds {limit} bytes");
                        let frame = error_frame(WireError::new("frame_too_long", message));
                        let _ = framed.send(frame).await;
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                };
                let reply = session.handle(&line).await;
                if let Err(e) = framed.send(reply).await {
                    break Err(e);
                }
            }
            Some(notification) = push_rx.recv() => {
                if let Err(e) = framed.send(Frame::Notification(notification)).await {
                    break Err(e);
                }
            }
        }
    };

    session.close_listens();
    result
}
