//! A single TCP connection to one node.
//!
//! A [`Link`] owns a background task that writes commands, matches replies
//! to requests in the order they were sent, and turns pub/sub pushes into
//! [`ConnectionEvent::Message`] events. When the socket fails the task fails
//! every outstanding request, marks the link disconnected and then emits an
//! [`ConnectionEvent::Error`] on the bus.
//!
//! Dropping the link stops the task and closes the socket.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use sentinel_resp::{Command, Frame, RespCodec};
use snafu::ResultExt;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace};

use crate::{
    config::LinkSettings,
    endpoint::Endpoint,
    error::{IoSnafu, Result, SdkError},
    signal::{ConnectionEvent, SignalBus},
};

/// Requests queued between the handle and the IO task.
const REQUEST_QUEUE: usize = 128;

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<Frame>>,
}

/// Handle to a connected socket.
#[derive(Debug)]
pub struct Link {
    endpoint: Endpoint,
    settings: LinkSettings,
    requests: mpsc::Sender<Request>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Link {
    /// Connects to `endpoint` within the configured connect timeout.
    ///
    /// Link failures and server error replies are emitted on `bus` when one
    /// is given; probes pass `None`.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Timeout` if the connect timeout elapses, or
    /// `SdkError::Io` if the socket cannot be opened.
    pub async fn connect(
        endpoint: &Endpoint,
        settings: &LinkSettings,
        bus: Option<Arc<SignalBus>>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(
            settings.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| timeout_error(settings.connect_timeout))?
        .context(IoSnafu)?;
        stream.set_nodelay(true).context(IoSnafu)?;

        let (requests, receiver) = mpsc::channel(REQUEST_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let task = IoTask {
            endpoint: endpoint.clone(),
            framed: Framed::new(stream, RespCodec::default()),
            requests: receiver,
            pending: VecDeque::new(),
            subscribed: false,
            connected: Arc::clone(&connected),
            shutdown: shutdown.clone(),
            bus,
        };
        tokio::spawn(task.run());

        debug!(node = %endpoint, "link connected");
        Ok(Self { endpoint: endpoint.clone(), settings: *settings, requests, connected, shutdown })
    }

    /// Returns the endpoint this link is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns true while the socket is open and the link has not been closed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// Sends a command and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Server` for an error reply, `SdkError::Timeout` if
    /// the command timeout elapses, or `SdkError::ConnectionLost` if the
    /// link drops before the reply arrives.
    pub async fn request(&self, command: Command) -> Result<Frame> {
        if !self.is_connected() {
            return Err(SdkError::ConnectionLost { message: "link is not connected".to_owned() });
        }

        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request { command, reply })
            .await
            .map_err(|_| SdkError::ConnectionLost { message: "link task stopped".to_owned() })?;

        let frame = match tokio::time::timeout(self.settings.command_timeout, rx).await {
            Err(_) => return Err(timeout_error(self.settings.command_timeout)),
            Ok(Err(_)) => {
                return Err(SdkError::ConnectionLost {
                    message: "link closed before reply".to_owned(),
                });
            },
            Ok(Ok(result)) => result?,
        };

        match frame {
            Frame::Error(message) => Err(SdkError::Server { message }),
            other => Ok(other),
        }
    }

    /// Subscribes the link to a pub/sub channel.
    ///
    /// After subscribing, messages on the channel are emitted on the bus.
    ///
    /// # Errors
    ///
    /// Returns the request error, or `SdkError::UnexpectedReply` if the node
    /// does not confirm the subscription.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        let reply = self.request(Command::new("SUBSCRIBE").arg(channel)).await?;
        let confirmed = reply
            .into_array()
            .and_then(|items| items.first().and_then(Frame::as_str).map(|kind| kind == "subscribe"))
            .unwrap_or(false);
        if confirmed {
            Ok(())
        } else {
            Err(SdkError::UnexpectedReply {
                message: format!("SUBSCRIBE {channel} was not confirmed"),
            })
        }
    }

    /// Closes the socket. Outstanding requests fail with `ConnectionLost`.
    ///
    /// No `Error` event is emitted for an intentional close.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct IoTask {
    endpoint: Endpoint,
    framed: Framed<TcpStream, RespCodec>,
    requests: mpsc::Receiver<Request>,
    pending: VecDeque<oneshot::Sender<Result<Frame>>>,
    subscribed: bool,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    bus: Option<Arc<SignalBus>>,
}

impl IoTask {
    async fn run(mut self) {
        let failure = loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break None,
                request = self.requests.recv() => {
                    let Some(request) = request else { break None };
                    if let Err(err) = self.write(request).await {
                        break Some(err);
                    }
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => self.dispatch(frame),
                    Some(Err(err)) => break Some(SdkError::from(err)),
                    None => {
                        break Some(SdkError::ConnectionLost {
                            message: "connection closed by peer".to_owned(),
                        });
                    },
                },
            }
        };

        self.connected.store(false, Ordering::Release);
        for reply in self.pending.drain(..) {
            let _ = reply.send(Err(SdkError::ConnectionLost { message: "link closed".to_owned() }));
        }

        match failure {
            Some(err) if !self.shutdown.is_cancelled() => {
                debug!(node = %self.endpoint, error = %err, "link failed");
                if let Some(bus) = &self.bus {
                    bus.emit(ConnectionEvent::Error(Arc::new(err)));
                }
            },
            _ => trace!(node = %self.endpoint, "link closed"),
        }
    }

    async fn write(&mut self, request: Request) -> Result<()> {
        if request.command.name().eq_ignore_ascii_case("SUBSCRIBE") {
            self.subscribed = true;
        }
        if let Err(err) = self.framed.send(request.command).await {
            let _ = request
                .reply
                .send(Err(SdkError::ConnectionLost { message: "write failed".to_owned() }));
            return Err(err.into());
        }
        self.pending.push_back(request.reply);
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame) {
        if self.subscribed {
            if let Some((channel, payload)) = as_message(&frame) {
                if let Some(bus) = &self.bus {
                    bus.emit(ConnectionEvent::Message { channel, payload });
                }
                return;
            }
        }

        if let (Some(bus), Some(message)) = (&self.bus, frame.error_message()) {
            bus.emit(ConnectionEvent::Error(Arc::new(SdkError::Server {
                message: message.to_owned(),
            })));
        }

        match self.pending.pop_front() {
            Some(reply) => {
                let _ = reply.send(Ok(frame));
            },
            None => trace!(node = %self.endpoint, ?frame, "unsolicited frame dropped"),
        }
    }
}

/// Recognizes a `["message", channel, payload]` push.
fn as_message(frame: &Frame) -> Option<(String, bytes::Bytes)> {
    let Frame::Array(Some(items)) = frame else { return None };
    match items.as_slice() {
        [kind, channel, Frame::Bulk(Some(payload))] if kind.as_str() == Some("message") => {
            Some((channel.as_str()?.to_owned(), payload.clone()))
        },
        _ => None,
    }
}

fn timeout_error(duration: Duration) -> SdkError {
    SdkError::Timeout { duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::mock::{MockNode, unreachable_endpoint};

    fn settings() -> LinkSettings {
        LinkSettings {
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn message_push_is_recognized() {
        let push = Frame::array(vec![
            Frame::from("message"),
            Frame::from("+switch-master"),
            Frame::from("mymaster 10.0.0.1 6379 10.0.0.2 6379"),
        ]);
        let (channel, payload) = as_message(&push).unwrap();
        assert_eq!(channel, "+switch-master");
        assert_eq!(payload.as_ref(), b"mymaster 10.0.0.1 6379 10.0.0.2 6379");

        let confirm =
            Frame::array(vec![Frame::from("subscribe"), Frame::from("ch"), Frame::Integer(1)]);
        assert!(as_message(&confirm).is_none());
    }

    #[tokio::test]
    async fn request_round_trip() {
        let node = MockNode::start().await.unwrap();
        let link = Link::connect(&node.endpoint(), &settings(), None).await.unwrap();

        let reply = link.request(Command::new("PING")).await.unwrap();
        assert_eq!(reply.as_str(), Some("PONG"));

        link.request(Command::new("SET").arg("k").arg("v")).await.unwrap();
        let reply = link.request(Command::new("GET").arg("k")).await.unwrap();
        assert_eq!(reply.as_str(), Some("v"));
    }

    #[tokio::test]
    async fn server_error_is_returned_and_emitted() {
        let node = MockNode::start().await.unwrap();
        let bus = Arc::new(SignalBus::new());
        let mut events = bus.subscribe();
        let link = Link::connect(&node.endpoint(), &settings(), Some(bus)).await.unwrap();

        let err = link.request(Command::new("NOPE")).await.unwrap_err();
        assert!(matches!(err, SdkError::Server { .. }));
        assert!(link.is_connected());

        match events.recv().await.unwrap() {
            ConnectionEvent::Error(err) => assert!(matches!(*err, SdkError::Server { .. })),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let endpoint = unreachable_endpoint().await;
        let err = Link::connect(&endpoint, &settings(), None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn peer_disconnect_marks_link_down_and_emits_error() {
        let node = MockNode::start().await.unwrap();
        let bus = Arc::new(SignalBus::new());
        let mut events = bus.subscribe();
        let link = Link::connect(&node.endpoint(), &settings(), Some(bus)).await.unwrap();
        link.request(Command::new("PING")).await.unwrap();

        node.drop_connections();

        match events.recv().await.unwrap() {
            ConnectionEvent::Error(err) => assert!(err.is_retryable()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!link.is_connected());
        assert!(link.request(Command::new("PING")).await.is_err());
    }

    #[tokio::test]
    async fn close_is_silent() {
        let node = MockNode::start().await.unwrap();
        let bus = Arc::new(SignalBus::new());
        let mut events = bus.subscribe();
        let link = Link::connect(&node.endpoint(), &settings(), Some(bus)).await.unwrap();

        link.close();
        assert!(!link.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_delivers_messages() {
        let node = MockNode::start().await.unwrap();
        let bus = Arc::new(SignalBus::new());
        let mut events = bus.subscribe();
        let link = Link::connect(&node.endpoint(), &settings(), Some(bus)).await.unwrap();

        link.subscribe("news").await.unwrap();
        assert_eq!(node.publish("news", "hello"), 1);

        match events.recv().await.unwrap() {
            ConnectionEvent::Message { channel, payload } => {
                assert_eq!(channel, "news");
                assert_eq!(payload.as_ref(), b"hello");
            },
            other => panic!("unexpected event {other:?}"),
        }
    }
}
