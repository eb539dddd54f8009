//! Failover notifications from the discovery nodes.

use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    signal::ConnectionEvent,
    supervisor::SentinelConnection,
};

/// Watches a discovery-node subscription for primary switch announcements.
///
/// The listener owns one supervised connection with the discovery role. It
/// subscribes to the failover channel on every bind and calls `on_switch`
/// for each announcement. Its own errors are logged and otherwise ignored.
#[derive(Debug)]
pub(crate) struct FailoverListener {
    connection: SentinelConnection,
    task: JoinHandle<()>,
}

impl FailoverListener {
    /// Subscribes `connection` to `channel` and starts watching it.
    pub(crate) fn spawn<F>(
        connection: SentinelConnection,
        events: broadcast::Receiver<ConnectionEvent>,
        channel: String,
        on_switch: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Err(err) = connection.subscribe(channel.clone()) {
            debug!(channel = %channel, error = %err, "failover subscription rejected");
        }
        let task = tokio::spawn(watch(events, channel, on_switch));
        Self { connection, task }
    }

    /// The discovery-role connection carrying the subscription.
    pub(crate) fn connection(&self) -> &SentinelConnection {
        &self.connection
    }

    /// Closes the subscription.
    pub(crate) fn stop(&self) {
        self.connection.quit();
        self.task.abort();
    }
}

async fn watch<F>(mut events: broadcast::Receiver<ConnectionEvent>, channel: String, on_switch: F)
where
    F: Fn() + Send + Sync + 'static,
{
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Message { channel: received, payload }) if received == channel => {
                info!(
                    channel = %channel,
                    announcement = %String::from_utf8_lossy(&payload),
                    "failover announced"
                );
                on_switch();
            },
            Ok(ConnectionEvent::Ready { endpoint }) => {
                debug!(node = %endpoint, channel = %channel, "failover listener bound");
            },
            Ok(ConnectionEvent::Error(err)) => {
                debug!(channel = %channel, error = %err, "failover listener error ignored");
            },
            Ok(ConnectionEvent::End) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) => {},
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "failover listener lagged");
            },
        }
    }
}
