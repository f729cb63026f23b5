use crate::ami::{CallDirection, CallOutcome, ExtensionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// PbxEvent is the normalized lifecycle event emitted by the manager client.
/// Downstream consumers treat these as the only source of call state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PbxEvent {
    /// An inbound call started ringing
    IncomingCall {
        call_id: String,
        caller_number: String,
        caller_name: String,
        destination: String,
        start_time: DateTime<Utc>,
    },

    /// A channel was answered
    CallAnswered {
        call_id: String,
        from: String,
        to: String,
        direction: CallDirection,
    },

    /// A channel hung up, emitted exactly once per call
    CallEnded {
        call_id: String,
        from: String,
        to: String,
        direction: CallDirection,
        duration: u64, // seconds
        outcome: CallOutcome,
        cause: Option<String>,
    },

    /// An extension changed presence state
    ExtensionStatus {
        extension: String,
        status: ExtensionStatus,
        code: i32,
    },

    /// Socket level failure
    ConnectionError { error: String },

    /// The manager connection closed
    Disconnected,
}

impl PbxEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PbxEvent::IncomingCall { .. } => "incoming_call",
            PbxEvent::CallAnswered { .. } => "call_answered",
            PbxEvent::CallEnded { .. } => "call_ended",
            PbxEvent::ExtensionStatus { .. } => "extension_status",
            PbxEvent::ConnectionError { .. } => "connection_error",
            PbxEvent::Disconnected => "disconnected",
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<PbxEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<PbxEvent>;

pub fn create_event_sender() -> EventSender {
    let (sender, _) = tokio::sync::broadcast::channel(256);
    sender
}

#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &PbxEvent);
}

pub type EventObserverRef = Arc<dyn EventObserver>;

/// Drive `observer` with every event from `receiver` until the token is
/// cancelled or the sender side is dropped.
pub fn spawn_observer(
    mut receiver: EventReceiver,
    observer: EventObserverRef,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = receiver.recv() => event,
            };
            match event {
                Ok(event) => observer.on_event(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event observer lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub struct LoggingObserver;

#[async_trait]
impl EventObserver for LoggingObserver {
    async fn on_event(&self, event: &PbxEvent) {
        match event {
            PbxEvent::IncomingCall {
                call_id,
                caller_number,
                destination,
                ..
            } => info!(call_id, caller_number, destination, "incoming call"),
            PbxEvent::CallAnswered {
                call_id, from, to, ..
            } => info!(call_id, from, to, "call answered"),
            PbxEvent::CallEnded {
                call_id,
                duration,
                outcome,
                cause,
                ..
            } => info!(call_id, duration, ?outcome, ?cause, "call ended"),
            PbxEvent::ExtensionStatus {
                extension, status, ..
            } => info!(extension, ?status, "extension status"),
            PbxEvent::ConnectionError { error } => warn!(error, "manager connection error"),
            PbxEvent::Disconnected => warn!("manager connection closed"),
        }
    }
}
