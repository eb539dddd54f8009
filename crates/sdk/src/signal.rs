//! Connection events and the interceptable signal path.
//!
//! Every event a connection produces passes through its [`SignalBus`]. A
//! [`SignalInterceptor`] registered on the bus sees `Error` and
//! `Reconnecting` events first and may consume them; all other events, and
//! whatever the interceptor forwards, reach subscribers in emission order.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{endpoint::Endpoint, error::SdkError};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Something that happened to a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection is bound to `endpoint` and accepts commands.
    Ready {
        /// Endpoint the link connected to.
        endpoint: Endpoint,
    },
    /// A failure on the link or during resolution.
    Error(Arc<SdkError>),
    /// The reconnect timer scheduled another attempt.
    Reconnecting {
        /// Attempt number since the last successful bind.
        attempt: u32,
        /// Delay before the attempt runs.
        delay: Duration,
    },
    /// A pub/sub message.
    Message {
        /// Channel the message was published on.
        channel: String,
        /// Message body.
        payload: Bytes,
    },
    /// The connection will produce no further events.
    End,
}

impl ConnectionEvent {
    /// Returns true for events an interceptor is consulted on.
    #[must_use]
    pub fn is_interceptable(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Reconnecting { .. })
    }
}

/// What an interceptor decided to do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Deliver the event to subscribers.
    Forward,
    /// Drop the event; the interceptor handles it.
    Consume,
}

/// Hook that sees `Error` and `Reconnecting` events before subscribers do.
pub trait SignalInterceptor: Send + Sync {
    /// Decides the fate of one event. Must not block.
    fn intercept(&self, event: &ConnectionEvent) -> Disposition;
}

/// Per-connection event fan-out with an optional interceptor.
pub struct SignalBus {
    interceptor: RwLock<Option<Arc<dyn SignalInterceptor>>>,
    sender: broadcast::Sender<ConnectionEvent>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("intercepted", &self.interceptor.read().is_some())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    /// Creates a bus with no interceptor.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { interceptor: RwLock::new(None), sender }
    }

    /// Installs the interceptor, replacing any previous one.
    pub fn set_interceptor(&self, interceptor: Arc<dyn SignalInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    /// Emits an event through the interceptor.
    pub fn emit(&self, event: ConnectionEvent) {
        if event.is_interceptable() {
            let interceptor = self.interceptor.read().clone();
            let consumed = interceptor
                .is_some_and(|interceptor| interceptor.intercept(&event) == Disposition::Consume);
            if consumed {
                return;
            }
        }
        self.forward(event);
    }

    /// Delivers an event to subscribers, bypassing the interceptor.
    pub fn forward(&self, event: ConnectionEvent) {
        // No subscribers is not an error; events are fire-and-forget.
        let _ = self.sender.send(event);
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }
}
