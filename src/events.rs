//! Lifecycle notifications
//!
//! Every store owns an `EventBus`. Observers subscribe to it to build audit
//! logs, invalidate caches or trigger replication without the engine
//! knowing about them.

use crate::record::Header;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Events published by a store
#[derive(Debug, Clone)]
pub enum StorageEvent {
    Insert {
        id: u64,
        header: Header,
    },
    Update {
        id: u64,
        header: Header,
    },
    Remove {
        id: u64,
    },
    Read {
        id: u64,
        header: Header,
    },
    /// Payload streamed to a sink; `range` is the inclusive byte range served
    Pipe {
        id: u64,
        header: Header,
        status: u16,
        range: Option<(u64, u64)>,
    },
    Send {
        id: u64,
        header: Header,
        url: String,
    },
    Error {
        id: Option<u64>,
        message: String,
    },
}

impl StorageEvent {
    /// Short event name (`insert`, `update`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            StorageEvent::Insert { .. } => "insert",
            StorageEvent::Update { .. } => "update",
            StorageEvent::Remove { .. } => "remove",
            StorageEvent::Read { .. } => "read",
            StorageEvent::Pipe { .. } => "pipe",
            StorageEvent::Send { .. } => "send",
            StorageEvent::Error { .. } => "error",
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &StorageEvent);
}

/// Broadcast bus for storage events
pub struct EventBus {
    sender: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: StorageEvent) {
        trace!(event = event.name(), "Emitting storage event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn error(&self, id: Option<u64>, message: impl Into<String>) {
        self.emit(StorageEvent::Error {
            id,
            message: message.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs every event through `tracing`
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &StorageEvent) {
        match event {
            StorageEvent::Insert { id, header } => {
                debug!(id, name = %header.name, length = header.length, "Record inserted");
            }
            StorageEvent::Update { id, header } => {
                debug!(id, name = %header.name, length = header.length, "Record updated");
            }
            StorageEvent::Remove { id } => {
                debug!(id, "Record removed");
            }
            StorageEvent::Send { id, url, .. } => {
                debug!(id, url = %url, "Record sent");
            }
            StorageEvent::Error { id, message } => {
                warn!(id = ?id, error = %message, "Storage error");
            }
            _ => {
                trace!(event = ?event, "Storage event");
            }
        }
    }
}

/// Spawn a background task that logs all events of a bus
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
