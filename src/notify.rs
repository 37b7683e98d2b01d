use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_NOTIFICATION_TEXT_LEN;
use crate::model::UserId;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    TripAccepted,
    ClaimRejected,
    ClaimSuperseded,
    ClaimExpired,
    TripStarted,
    TripCompleted,
    TripCancelled,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Default,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKind::TripAccepted => "trip_accepted",
            TemplateKind::ClaimRejected => "claim_rejected",
            TemplateKind::ClaimSuperseded => "claim_superseded",
            TemplateKind::ClaimExpired => "claim_expired",
            TemplateKind::TripStarted => "trip_started",
            TemplateKind::TripCompleted => "trip_completed",
            TemplateKind::TripCancelled => "trip_cancelled",
            TemplateKind::General => "general",
        }
    }

    /// Claim outcomes are time-sensitive for drivers; so is a rider's match.
    pub fn priority(self) -> Priority {
        match self {
            TemplateKind::TripAccepted
            | TemplateKind::ClaimRejected
            | TemplateKind::ClaimSuperseded
            | TemplateKind::ClaimExpired => Priority::High,
            _ => Priority::Default,
        }
    }

    fn text(self) -> (&'static str, &'static str) {
        match self {
            TemplateKind::TripAccepted => {
                ("Driver found", "A driver accepted your trip and is on the way.")
            }
            TemplateKind::ClaimRejected => {
                ("Trip taken", "Another driver already accepted this trip.")
            }
            TemplateKind::ClaimSuperseded => {
                ("Trip taken", "This trip was accepted by another driver.")
            }
            TemplateKind::ClaimExpired => {
                ("Request closed", "This trip request is no longer available.")
            }
            TemplateKind::TripStarted => ("Trip started", "You are on your way."),
            TemplateKind::TripCompleted => ("Trip completed", "You have arrived."),
            TemplateKind::TripCancelled => {
                ("Trip cancelled", "The other party cancelled the trip.")
            }
            TemplateKind::General => ("", ""),
        }
    }
}

/// What a recipient's device needs to act on a notification. Carries ids,
/// not just text, so a redelivered copy can be recognised downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub trip_id: Option<Ulid>,
    pub claim_id: Option<Ulid>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NotifyPayload {
    pub fn from_template(kind: TemplateKind, trip_id: Ulid, claim_id: Option<Ulid>) -> Self {
        let (title, body) = kind.text();
        Self {
            trip_id: Some(trip_id),
            claim_id,
            title: title.into(),
            body: body.into(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A delivered notification as seen by a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: UserId,
    pub kind: TemplateKind,
    pub priority: Priority,
    pub payload: NotifyPayload,
}

/// Best-effort delivery to a user. Returns whether the notification reached
/// anyone; never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, kind: TemplateKind, payload: &NotifyPayload) -> bool;
}

/// Notify and log a miss. Delivery failures stop here.
pub async fn notify_logged<N: Notifier + ?Sized>(
    notifier: &N,
    recipient: &str,
    kind: TemplateKind,
    payload: &NotifyPayload,
) -> bool {
    let delivered = notifier.notify(recipient, kind, payload).await;
    metrics::counter!(
        crate::observability::NOTIFICATIONS_TOTAL,
        "kind" => kind.as_str(),
        "delivered" => if delivered { "true" } else { "false" }
    )
    .increment(1);
    if !delivered {
        warn!("notification {} to {recipient} not delivered", kind.as_str());
    }
    delivered
}

/// Per-recipient broadcast channels. Each connected device of a user
/// subscribes to that user's channel.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, recipient: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(recipient.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns true if at least one listener received it.
    pub fn send(&self, notification: Notification) -> bool {
        match self.channels.get(&notification.recipient) {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        }
    }

    /// Drop channels nobody listens on any more.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, recipient: &str, kind: TemplateKind, payload: &NotifyPayload) -> bool {
        let delivered = self.send(Notification {
            recipient: recipient.to_string(),
            kind,
            priority: kind.priority(),
            payload: payload.clone(),
        });
        if !delivered {
            debug!("no listener for {recipient}");
        }
        delivered
    }
}

// ── Administrative test entry point ──────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum NotifyError {
    InvalidArgument(&'static str),
}

impl NotifyError {
    pub fn code(&self) -> &'static str {
        match self {
            NotifyError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Send a hand-written notification straight through the notifier, outside
/// any resolution. Returns whether it was delivered.
pub async fn send_test_notification<N: Notifier + ?Sized>(
    notifier: &N,
    recipient: &str,
    title: &str,
    body: &str,
    kind: Option<TemplateKind>,
    data: Map<String, Value>,
) -> Result<bool, NotifyError> {
    if recipient.trim().is_empty() {
        return Err(NotifyError::InvalidArgument("recipient is required"));
    }
    if title.trim().is_empty() {
        return Err(NotifyError::InvalidArgument("title is required"));
    }
    if body.trim().is_empty() {
        return Err(NotifyError::InvalidArgument("body is required"));
    }
    if title.len() + body.len() > MAX_NOTIFICATION_TEXT_LEN {
        return Err(NotifyError::InvalidArgument("title and body too long"));
    }

    let payload = NotifyPayload {
        trip_id: None,
        claim_id: None,
        title: title.to_string(),
        body: body.to_string(),
        data,
    };
    Ok(notify_logged(notifier, recipient, kind.unwrap_or(TemplateKind::General), &payload).await)
}
