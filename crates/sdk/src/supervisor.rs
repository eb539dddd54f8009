//! Supervised connections that follow their role across failovers.
//!
//! A [`SentinelConnection`] resolves an endpoint for its role, binds a
//! [`Link`] to it and re-resolves whenever the link drops.
//!
//! # State machine
//!
//! ```text
//! Unbound ──resolve ok──▶ Connecting ──link up──▶ Bound
//!    │                        ▲                     │ link down
//!    │ resolve failed         │ timer / forced      ▼
//!    └──────────────────▶ ReconnectPending ◀────────┘
//!
//! any state ──quit──▶ Closed
//! ReconnectPending ──attempts exhausted──▶ Closed ──forced──▶ ReconnectPending
//! ```
//!
//! All transitions run on one driver task per connection. The link's
//! signals reach the driver through an interceptor registered on the
//! connection's [`SignalBus`]:
//!
//! - `Error` while the link is connected (or the connection is closing) is
//!   forwarded to subscribers untouched.
//! - `Error` while the link is down is consumed and triggers a resolution;
//!   the new endpoint is recorded before the link is rebound.
//! - `Reconnecting` (the reconnect timer firing) clears the endpoint and
//!   triggers a resolution followed by an immediate reconnect; the event is
//!   then forwarded.

use std::{
    collections::HashSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use sentinel_resp::{Command, Frame};
use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backoff::ReconnectSchedule,
    config::{LinkSettings, ReconnectPolicy},
    discovery::Resolver,
    endpoint::{Endpoint, Role, RoleQuery},
    error::{Result, SdkError},
    link::Link,
    signal::{ConnectionEvent, Disposition, SignalBus, SignalInterceptor},
};

/// Lifecycle state of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; the first resolution has not succeeded yet.
    Unbound,
    /// An endpoint was resolved and the link is being opened.
    Connecting,
    /// The link is up.
    Bound,
    /// The link is down; a resolution is running or scheduled.
    ReconnectPending,
    /// Closed intentionally, or out of reconnect attempts. An exhausted
    /// connection leaves this state on a forced reconnect.
    Closed,
}

/// Work queued for the driver task.
#[derive(Debug)]
enum Control {
    /// Resolve again and rebind, keeping the endpoint until a new one is known.
    Resolve,
    /// Clear the endpoint, resolve and reconnect immediately.
    Reconnect,
    /// Subscribe the bound link to a channel.
    Subscribe(String),
}

#[derive(Debug)]
struct Shared {
    id: u64,
    query: RoleQuery,
    resolver: Resolver,
    settings: LinkSettings,
    endpoint: RwLock<Option<Endpoint>>,
    state: RwLock<ConnectionState>,
    link: RwLock<Option<Arc<Link>>>,
    subscriptions: Mutex<Vec<String>>,
    closing: AtomicBool,
    reconnecting: AtomicBool,
    bus: Arc<SignalBus>,
    control: mpsc::UnboundedSender<Control>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Moves to `state` unless the connection is closing.
    ///
    /// `quit` sets `closing` before it takes the state lock, so a transition
    /// can never overwrite `Closed`.
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if !self.is_closing() {
            *current = state;
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        self.link.read().as_ref().is_some_and(|link| link.is_connected())
    }

    /// Queues a rebind unless one is already queued or running.
    fn request_rebind(&self, control: Control) -> bool {
        if self.is_closing() {
            return false;
        }
        if self.reconnecting.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return false;
        }
        if self.control.send(control).is_err() {
            self.reconnecting.store(false, Ordering::Release);
            return false;
        }
        true
    }
}

/// Routes link signals into the driver.
struct Interceptor {
    shared: Weak<Shared>,
}

impl SignalInterceptor for Interceptor {
    fn intercept(&self, event: &ConnectionEvent) -> Disposition {
        let Some(shared) = self.shared.upgrade() else {
            return Disposition::Forward;
        };
        match event {
            ConnectionEvent::Error(_) => {
                if shared.is_closing() || shared.is_connected() {
                    return Disposition::Forward;
                }
                shared.set_state(ConnectionState::ReconnectPending);
                shared.request_rebind(Control::Resolve);
                Disposition::Consume
            },
            ConnectionEvent::Reconnecting { .. } => {
                shared.request_rebind(Control::Reconnect);
                Disposition::Forward
            },
            _ => Disposition::Forward,
        }
    }
}

/// A connection bound to whichever node currently holds its role.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Debug, Clone)]
pub struct SentinelConnection {
    shared: Arc<Shared>,
}

impl SentinelConnection {
    fn new(
        id: u64,
        query: RoleQuery,
        resolver: Resolver,
        settings: LinkSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control, receiver) = mpsc::unbounded_channel();
        let bus = Arc::new(SignalBus::new());
        let shared = Arc::new(Shared {
            id,
            query,
            resolver,
            settings,
            endpoint: RwLock::new(None),
            state: RwLock::new(ConnectionState::Unbound),
            link: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            bus: Arc::clone(&bus),
            control,
            shutdown: CancellationToken::new(),
        });
        bus.set_interceptor(Arc::new(Interceptor { shared: Arc::downgrade(&shared) }));
        (Self { shared }, receiver)
    }

    /// Creates a connection and starts resolving in the background.
    ///
    /// The returned receiver is subscribed before the driver starts, so it
    /// sees every event the connection emits. Must be called within a Tokio
    /// runtime.
    pub(crate) fn spawn(
        id: u64,
        query: RoleQuery,
        resolver: Resolver,
        settings: LinkSettings,
        policy: ReconnectPolicy,
    ) -> (Self, broadcast::Receiver<ConnectionEvent>) {
        let (connection, receiver) = Self::new(id, query, resolver, settings);
        let events = connection.events();
        connection.start(receiver, policy);
        (connection, events)
    }

    fn start(&self, receiver: mpsc::UnboundedReceiver<Control>, policy: ReconnectPolicy) {
        let driver = Driver {
            shared: Arc::clone(&self.shared),
            control: receiver,
            schedule: ReconnectSchedule::new(policy),
            retry: None,
            subscribed: HashSet::new(),
            exhausted: false,
        };
        self.shared.reconnecting.store(true, Ordering::Release);
        tokio::spawn(driver.run());
    }

    /// Registry-unique identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Role this connection binds to.
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.query.role
    }

    /// Cluster name used for resolution.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.shared.query.cluster_name
    }

    /// Endpoint of the last successful resolution.
    ///
    /// Host and port always come from the same resolution. `None` before
    /// the first resolution and while a forced reconnect is resolving.
    #[must_use]
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.shared.endpoint.read().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Returns true while the underlying link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Returns true once [`quit`](Self::quit) was called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    /// Subscribes to events emitted from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.bus.subscribe()
    }

    /// Sends a command on the bound link.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::NotConnected` while no link is bound,
    /// `SdkError::Closed` after [`quit`](Self::quit), or the link's error.
    pub async fn command(&self, command: Command) -> Result<Frame> {
        let link = self.shared.link.read().clone();
        match link {
            Some(link) => link.request(command).await,
            None if self.is_closing() => Err(SdkError::Closed),
            None => Err(SdkError::NotConnected),
        }
    }

    /// Subscribes to a pub/sub channel on every link this connection binds.
    ///
    /// Messages arrive as [`ConnectionEvent::Message`] on [`events`](Self::events).
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Closed` after [`quit`](Self::quit).
    pub fn subscribe(&self, channel: impl Into<String>) -> Result<()> {
        if self.is_closing() {
            return Err(SdkError::Closed);
        }
        let channel = channel.into();
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            if !subscriptions.contains(&channel) {
                subscriptions.push(channel.clone());
            }
        }
        // The driver is gone only after quit; nothing to subscribe then.
        let _ = self.shared.control.send(Control::Subscribe(channel));
        Ok(())
    }

    /// Waits for the connection to be bound.
    ///
    /// Returns immediately if it already is.
    ///
    /// # Errors
    ///
    /// Returns the first error event (for example an exhausted resolution),
    /// or `SdkError::Closed` if the connection ends first.
    pub async fn wait_ready(&self) -> Result<Endpoint> {
        let mut events = self.events();
        if self.state() == ConnectionState::Bound {
            if let Some(endpoint) = self.current_endpoint() {
                return Ok(endpoint);
            }
        }
        if self.is_closing() {
            return Err(SdkError::Closed);
        }
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Ready { endpoint }) => return Ok(endpoint),
                Ok(ConnectionEvent::Error(source)) => return Err(SdkError::Signalled { source }),
                Ok(ConnectionEvent::End) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(SdkError::Closed);
                },
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
            }
        }
    }

    /// Forces the connection through its reconnect path.
    ///
    /// Returns false if the connection is closing or a reconnect is already
    /// queued or running.
    pub fn force_reconnect(&self) -> bool {
        let queued = self.shared.request_rebind(Control::Reconnect);
        if queued {
            debug!(connection = self.shared.id, "forced reconnect queued");
        }
        queued
    }

    /// Closes the connection intentionally.
    ///
    /// Emits `End`. A resolution still in flight is discarded when it
    /// completes. Calling `quit` twice is a no-op.
    pub fn quit(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.cancel();
        if let Some(link) = self.shared.link.write().take() {
            link.close();
        }
        // A bind commits under the same lock, so `Ready` never follows `End`.
        let mut state = self.shared.state.write();
        *state = ConnectionState::Closed;
        debug!(connection = self.shared.id, "connection closed");
        self.shared.bus.forward(ConnectionEvent::End);
    }
}

/// Owns every state transition of one connection.
struct Driver {
    shared: Arc<Shared>,
    control: mpsc::UnboundedReceiver<Control>,
    schedule: ReconnectSchedule,
    /// Next timer tick: deadline, attempt number, delay.
    retry: Option<(Instant, u32, Duration)>,
    /// Channels subscribed on the current link.
    subscribed: HashSet<String>,
    /// Out of reconnect attempts; only a forced reconnect revives it.
    exhausted: bool,
}

impl Driver {
    async fn run(mut self) {
        self.rebind(false).await;

        loop {
            let deadline = self.retry.map_or_else(Instant::now, |(at, _, _)| at);
            tokio::select! {
                biased;
                () = self.shared.shutdown.cancelled() => break,
                control = self.control.recv() => match control {
                    Some(Control::Resolve) => self.rebind(false).await,
                    Some(Control::Reconnect) => {
                        if std::mem::take(&mut self.exhausted) {
                            debug!(connection = self.shared.id, "reviving exhausted connection");
                            self.schedule.reset();
                        }
                        self.rebind(true).await;
                    },
                    Some(Control::Subscribe(channel)) => self.subscribe(channel).await,
                    None => break,
                },
                () = tokio::time::sleep_until(deadline), if self.retry.is_some() => {
                    if let Some((_, attempt, delay)) = self.retry.take() {
                        debug!(connection = self.shared.id, attempt, "reconnect timer fired");
                        self.shared.bus.emit(ConnectionEvent::Reconnecting { attempt, delay });
                    }
                },
            }
        }
    }

    async fn rebind(&mut self, clear: bool) {
        let shared = Arc::clone(&self.shared);
        if shared.is_closing() {
            shared.reconnecting.store(false, Ordering::Release);
            return;
        }

        if clear {
            let mut state = shared.state.write();
            if shared.is_closing() {
                drop(state);
                shared.reconnecting.store(false, Ordering::Release);
                return;
            }
            *shared.endpoint.write() = None;
            if *state != ConnectionState::Unbound {
                *state = ConnectionState::ReconnectPending;
            }
        }

        let resolved = shared.resolver.resolve(&shared.query).await;
        let endpoint = match resolved {
            Ok(endpoint) => endpoint,
            Err(exhausted) => return self.fail(exhausted.into()),
        };

        {
            let mut state = shared.state.write();
            if shared.is_closing() {
                drop(state);
                debug!(connection = shared.id, "discarding resolution for closed connection");
                shared.reconnecting.store(false, Ordering::Release);
                return;
            }
            *shared.endpoint.write() = Some(endpoint.clone());
            *state = ConnectionState::Connecting;
        }

        let stale = shared.link.write().take();
        if let Some(stale) = stale {
            stale.close();
        }
        self.subscribed.clear();

        let link = match Link::connect(&endpoint, &shared.settings, Some(Arc::clone(&shared.bus))).await {
            Ok(link) => Arc::new(link),
            Err(err) => return self.fail(err),
        };
        if shared.is_closing() {
            return self.discard(&link);
        }
        *shared.link.write() = Some(Arc::clone(&link));

        let channels = shared.subscriptions.lock().clone();
        for channel in channels {
            self.subscribe_on(&link, channel).await;
        }

        let mut state = shared.state.write();
        if shared.is_closing() {
            drop(state);
            return self.discard(&link);
        }
        self.schedule.reset();
        self.retry = None;
        *state = ConnectionState::Bound;
        shared.reconnecting.store(false, Ordering::Release);
        info!(
            connection = shared.id,
            role = %shared.query.role,
            endpoint = %endpoint,
            "connection bound"
        );
        shared.bus.emit(ConnectionEvent::Ready { endpoint });
    }

    /// Drops a link opened for a connection that was closed meanwhile.
    fn discard(&mut self, link: &Link) {
        debug!(connection = self.shared.id, "discarding bind for closed connection");
        link.close();
        if let Some(stored) = self.shared.link.write().take() {
            stored.close();
        }
        self.subscribed.clear();
        self.shared.reconnecting.store(false, Ordering::Release);
    }

    /// Reports a failed rebind and arms the reconnect timer.
    ///
    /// Runs under the state lock so nothing is emitted after a concurrent
    /// `quit` has emitted `End`.
    fn fail(&mut self, err: SdkError) {
        let shared = Arc::clone(&self.shared);
        shared.reconnecting.store(false, Ordering::Release);
        let mut state = shared.state.write();
        if shared.is_closing() {
            debug!(connection = shared.id, error = %err, "rebind failed after close");
            return;
        }
        debug!(connection = shared.id, error = %err, "rebind failed");
        *state = ConnectionState::ReconnectPending;
        shared.bus.forward(ConnectionEvent::Error(Arc::new(err)));

        match self.schedule.next_delay() {
            Some((attempt, delay)) => {
                self.retry = Some((Instant::now() + delay, attempt, delay));
            },
            None => {
                let attempts = self.schedule.attempts();
                warn!(connection = shared.id, attempts, "reconnect attempts exhausted");
                self.retry = None;
                self.exhausted = true;
                *state = ConnectionState::Closed;
                shared.bus.forward(ConnectionEvent::Error(Arc::new(SdkError::ReconnectExhausted {
                    attempts,
                })));
                shared.bus.forward(ConnectionEvent::End);
            },
        }
    }

    async fn subscribe(&mut self, channel: String) {
        let link = self.shared.link.read().clone();
        if let Some(link) = link {
            self.subscribe_on(&link, channel).await;
        }
    }

    async fn subscribe_on(&mut self, link: &Link, channel: String) {
        if self.subscribed.contains(&channel) {
            return;
        }
        match link.subscribe(&channel).await {
            Ok(()) => {
                debug!(connection = self.shared.id, channel = %channel, "subscribed");
                self.subscribed.insert(channel);
            },
            Err(err) => {
                debug!(connection = self.shared.id, channel = %channel, error = %err, "subscribe failed");
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use sentinel_test_utils::{assert_eventually, next_matching};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        discovery::{NodeList, Probe, ProbeError, SentinelProbe},
        mock::{MockNode, unreachable_endpoint},
    };

    /// Answers every query with a fixed endpoint after a delay.
    #[derive(Debug)]
    struct DelayedAnswer {
        answer: Endpoint,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl DelayedAnswer {
        fn new(answer: Endpoint, delay: Duration) -> Arc<Self> {
            Arc::new(Self { answer, delay, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Probe for DelayedAnswer {
        async fn probe(
            &self,
            _node: &Endpoint,
            _query: &RoleQuery,
        ) -> std::result::Result<Endpoint, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.answer.clone())
        }
    }

    fn scripted(
        answers: Arc<DelayedAnswer>,
        policy: ReconnectPolicy,
    ) -> (SentinelConnection, broadcast::Receiver<ConnectionEvent>) {
        let resolver = Resolver::builder()
            .nodes(NodeList::new(vec![Endpoint::new("127.0.0.1", 1)]))
            .probe(answers)
            .build();
        let query = RoleQuery::new(Role::Primary, CLUSTER);
        SentinelConnection::spawn(1, query, resolver, settings(), policy)
    }

    fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    const CLUSTER: &str = "mymaster";

    fn settings() -> LinkSettings {
        LinkSettings {
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(2),
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::builder()
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_millis(200))
            .jitter(0.0)
            .build()
    }

    fn connection(nodes: Vec<Endpoint>, policy: ReconnectPolicy) -> SentinelConnection {
        let resolver = Resolver::builder()
            .nodes(NodeList::new(nodes))
            .probe(Arc::new(SentinelProbe::new(settings())))
            .build();
        let query = RoleQuery::new(Role::Primary, CLUSTER);
        SentinelConnection::spawn(1, query, resolver, settings(), policy).0
    }

    #[test]
    fn interceptor_without_connection_forwards() {
        let interceptor = Interceptor { shared: Weak::new() };
        let event = ConnectionEvent::Error(Arc::new(SdkError::NotConnected));
        assert_eq!(interceptor.intercept(&event), Disposition::Forward);
    }

    #[tokio::test]
    async fn binds_to_resolved_primary() {
        let data = MockNode::start().await.unwrap();
        let sentinel = MockNode::start().await.unwrap();
        sentinel.set_master(CLUSTER, data.endpoint());

        let conn = connection(vec![sentinel.endpoint()], policy());
        assert_eq!(conn.wait_ready().await.unwrap(), data.endpoint());
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert_eq!(conn.current_endpoint(), Some(data.endpoint()));

        conn.command(Command::new("SET").arg("k").arg("v")).await.unwrap();
        assert_eq!(data.get("k").as_deref(), Some(b"v".as_slice()));
    }

    #[tokio::test]
    async fn command_before_bind_fails_fast() {
        let conn = connection(vec![unreachable_endpoint().await], policy());
        let err = conn.command(Command::new("PING")).await.unwrap_err();
        assert!(matches!(err, SdkError::NotConnected));
    }

    #[tokio::test]
    async fn initial_failure_is_reported_then_retried() {
        let data = MockNode::start().await.unwrap();
        let sentinel = MockNode::start().await.unwrap();

        let conn = connection(vec![sentinel.endpoint()], policy());
        let err = conn.wait_ready().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to find a master/replica from any of the discovery nodes"
        );

        sentinel.set_master(CLUSTER, data.endpoint());
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match conn.wait_ready().await {
                        Ok(endpoint) => break endpoint,
                        Err(_) => continue,
                    }
                }
            })
            .await
            .unwrap(),
            data.endpoint()
        );
    }

    #[tokio::test]
    async fn exhausted_schedule_ends_connection() {
        let policy = ReconnectPolicy::builder()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(10))
            .jitter(0.0)
            .max_attempts(2)
            .build();
        let conn = connection(vec![unreachable_endpoint().await], policy);
        let mut events = conn.events();

        let mut reconnecting = 0;
        let mut exhausted = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
                ConnectionEvent::Reconnecting { .. } => reconnecting += 1,
                ConnectionEvent::Error(err) => {
                    exhausted |= matches!(*err, SdkError::ReconnectExhausted { attempts: 2 });
                },
                ConnectionEvent::End => break,
                _ => {},
            }
        }
        assert_eq!(reconnecting, 2);
        assert!(exhausted);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_closing());
    }

    #[tokio::test]
    async fn quit_ends_and_rejects_commands() {
        let data = MockNode::start().await.unwrap();
        let sentinel = MockNode::start().await.unwrap();
        sentinel.set_master(CLUSTER, data.endpoint());

        let conn = connection(vec![sentinel.endpoint()], policy());
        conn.wait_ready().await.unwrap();
        let mut events = conn.events();

        conn.quit();
        conn.quit();

        assert!(conn.is_closing());
        assert!(!conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::End));
        assert!(matches!(conn.command(Command::new("PING")).await, Err(SdkError::Closed)));
        assert!(!conn.force_reconnect());
        assert!(conn.subscribe("ch").is_err());
    }

    #[tokio::test]
    async fn forced_reconnect_is_guarded() {
        let data = MockNode::start().await.unwrap();
        let sentinel = MockNode::start().await.unwrap();
        sentinel.set_master(CLUSTER, data.endpoint());

        let conn = connection(vec![sentinel.endpoint()], policy());
        conn.wait_ready().await.unwrap();
        let mut events = conn.events();

        assert!(conn.force_reconnect());
        assert!(!conn.force_reconnect());

        loop {
            if let ConnectionEvent::Ready { endpoint } = events.recv().await.unwrap() {
                assert_eq!(endpoint, data.endpoint());
                break;
            }
        }
        let reconnected = assert_eventually(Duration::from_secs(2), || {
            data.accepted_count() == 2
        })
        .await;
        assert!(reconnected);
    }

    #[tokio::test]
    async fn quit_during_resolution_discards_result() {
        let data = MockNode::start().await.unwrap();
        let answers = DelayedAnswer::new(data.endpoint(), Duration::from_millis(200));
        let (conn, mut events) = scripted(Arc::clone(&answers), policy());

        assert!(assert_eventually(Duration::from_secs(2), || answers.calls() == 1).await);
        conn.quit();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.current_endpoint(), None);
        assert_eq!(data.accepted_count(), 0);
        let seen = drain(&mut events);
        assert!(matches!(seen.as_slice(), [ConnectionEvent::End]), "unexpected events {seen:?}");
    }

    #[tokio::test]
    async fn quit_during_subscribe_discards_bind() {
        // Accepts connections but never replies.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::from(silent.local_addr().unwrap());
        let answers = DelayedAnswer::new(target.clone(), Duration::ZERO);
        let (conn, mut events) = scripted(answers, policy());
        conn.subscribe("chan").unwrap();

        let (stream, _) = silent.accept().await.unwrap();
        stream.readable().await.unwrap();
        conn.quit();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_connected());
        assert_eq!(conn.current_endpoint(), Some(target));
        let seen = drain(&mut events);
        assert!(seen.iter().any(|event| matches!(event, ConnectionEvent::End)));
        assert!(
            !seen.iter().any(|event| matches!(event, ConnectionEvent::Ready { .. })),
            "no Ready after End, got {seen:?}"
        );
    }

    #[tokio::test]
    async fn exhausted_connection_revives_on_forced_reconnect() {
        let data = MockNode::start().await.unwrap();
        let sentinel = MockNode::start().await.unwrap();
        let once = ReconnectPolicy::builder()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(10))
            .jitter(0.0)
            .max_attempts(1)
            .build();
        let conn = connection(vec![sentinel.endpoint()], once);
        let mut events = conn.events();

        let ended = next_matching(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ConnectionEvent::End)
        })
        .await;
        assert!(ended.is_some());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_closing());

        sentinel.set_master(CLUSTER, data.endpoint());
        assert!(conn.force_reconnect());

        let expected = data.endpoint();
        let ready = next_matching(&mut events, Duration::from_secs(5), |event| {
            matches!(event, ConnectionEvent::Ready { endpoint } if *endpoint == expected)
        })
        .await;
        assert!(ready.is_some());
        assert_eq!(conn.state(), ConnectionState::Bound);
        conn.command(Command::new("PING")).await.unwrap();
    }
}
