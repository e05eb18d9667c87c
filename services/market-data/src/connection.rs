//! Exchange connection lifecycle
//!
//! [`ConnectionStateMachine`] is pure: it maps an event to a new state and
//! a list of [`Action`]s, and knows nothing about sockets or timers.
//! [`ExchangeConnection`] is the async driver that owns one session at a
//! time, feeds the machine and performs its actions.
//!
//! ```text
//!   Disconnected --Start--> Connecting --Connected--> Connected
//!        ^                     |   ^                      |
//!        |             failure |   | delay elapsed        | failure / ping rejected / closed
//!        |                     v   |                      v
//!        +----- Shutdown ---- Failed <--------------------+
//! ```
//!
//! Reconnect attempts are unbounded; the delay grows with
//! [`ReconnectBackoff`] and resets on every successful connect. Each new
//! session starts with an empty tracked set and exactly one reconcile.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::prelude::{DataKind, Exchange, Symbol};

use crate::adapters::ExchangeAdapter;
use crate::backoff::ReconnectBackoff;
use crate::config::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ReconcileError, TransportError};
use crate::metrics::EngineMetrics;
use crate::reconciler::{Reconciler, SubscriptionDelta, SubscriptionTracker};
use crate::transport::{Connector, InboundFrame, Link, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Shutdown requested; waiting for the transport to close.
    Closing,
    /// Session lost; a reconnect is scheduled.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    Connected,
    TransportFailed,
    PingRejected,
    Closed,
    ReconnectDelayElapsed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    ScheduleReconnect(Duration),
    CancelReconnect,
    ClearTracked,
    Reconcile,
    CloseTransport,
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    backoff: ReconnectBackoff,
    reconnect_scheduled: bool,
    shutting_down: bool,
}

impl ConnectionStateMachine {
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            reconnect_scheduled: false,
            shutting_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Apply one event. Events that make no sense in the current state
    /// return no actions and leave the state alone.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Action> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self.state, event) {
            (S::Disconnected, E::Start) if !self.shutting_down => {
                self.state = S::Connecting;
                vec![Action::Connect]
            }
            (S::Connecting, E::Connected) => {
                self.state = S::Connected;
                self.backoff.reset();
                vec![Action::ClearTracked, Action::Reconcile]
            }
            (S::Connected, E::TransportFailed | E::PingRejected | E::Closed)
            | (S::Connecting, E::TransportFailed) => self.fail(),
            (S::Failed, E::TransportFailed | E::PingRejected | E::Closed) => {
                if self.reconnect_scheduled {
                    Vec::new()
                } else {
                    self.fail()
                }
            }
            (S::Failed, E::ReconnectDelayElapsed) if self.reconnect_scheduled => {
                self.reconnect_scheduled = false;
                self.state = S::Connecting;
                vec![Action::Connect]
            }

            (_, E::Shutdown) => self.shutdown(),
            (S::Closing, E::Closed | E::TransportFailed) => {
                self.state = S::Disconnected;
                Vec::new()
            }

            _ => Vec::new(),
        }
    }

    fn fail(&mut self) -> Vec<Action> {
        self.state = ConnectionState::Failed;
        self.reconnect_scheduled = true;
        vec![
            Action::CloseTransport,
            Action::ScheduleReconnect(self.backoff.next_delay()),
        ]
    }

    fn shutdown(&mut self) -> Vec<Action> {
        self.shutting_down = true;
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Closing;
                vec![Action::CloseTransport]
            }
            // The in-flight connect attempt is abandoned by the driver.
            ConnectionState::Connecting => {
                self.state = ConnectionState::Disconnected;
                Vec::new()
            }
            ConnectionState::Failed => {
                self.state = ConnectionState::Disconnected;
                self.reconnect_scheduled = false;
                vec![Action::CancelReconnect]
            }
            ConnectionState::Disconnected | ConnectionState::Closing => Vec::new(),
        }
    }
}

/// Control surface of a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    exchange: Exchange,
    state: watch::Receiver<ConnectionState>,
    tracker: Arc<SubscriptionTracker>,
    reconciler: Arc<Reconciler>,
}

impl ConnectionHandle {
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the published state equals `target`. Returns false if the
    /// connection task is gone.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s == target).await.is_ok();
        reached
    }

    pub async fn reconcile(&self, kind: DataKind) -> Result<SubscriptionDelta, ReconcileError> {
        self.reconciler.reconcile(kind).await
    }

    pub async fn reconcile_all(&self) -> Vec<(DataKind, Result<SubscriptionDelta, ReconcileError>)> {
        self.reconciler.reconcile_all().await
    }

    pub fn subscribed(&self, kind: DataKind) -> BTreeSet<Symbol> {
        self.tracker.subscribed(kind)
    }

    pub fn total_subscribed(&self) -> usize {
        self.tracker.total_subscribed()
    }
}

pub struct ExchangeConnection {
    adapter: Arc<dyn ExchangeAdapter>,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<SubscriptionTracker>,
    reconciler: Arc<Reconciler>,
    metrics: Arc<EngineMetrics>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ExchangeConnection {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<SubscriptionTracker>,
        reconciler: Arc<Reconciler>,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, ConnectionHandle) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = ConnectionHandle {
            exchange: adapter.exchange(),
            state: state_rx,
            tracker: tracker.clone(),
            reconciler: reconciler.clone(),
        };
        let connection = Self {
            adapter,
            connector,
            config,
            dispatcher,
            tracker,
            reconciler,
            metrics,
            state_tx,
        };
        (connection, handle)
    }

    /// Drive the connection until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let exchange = self.adapter.exchange();
        let mut machine = ConnectionStateMachine::new(ReconnectBackoff::new(
            self.config.initial_reconnect_delay,
            self.config.max_reconnect_delay,
            self.config.max_jitter,
        ));
        let mut pending: VecDeque<Action> = VecDeque::new();
        let mut session: Option<Link> = None;
        let mut reconnect_at: Option<Instant> = None;
        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if *shutdown.borrow() {
            return;
        }
        info!(exchange = %exchange, url = self.adapter.stream_url(), "exchange connection starting");
        pending.extend(machine.handle(ConnectionEvent::Start));

        loop {
            while let Some(action) = pending.pop_front() {
                match action {
                    Action::Connect => {
                        self.publish(ConnectionState::Connecting);
                        let url = self.adapter.stream_url().to_string();
                        let attempt = tokio::select! {
                            result = timeout(
                                self.config.connect_timeout,
                                self.connector.connect(&url, self.config.outbound_queue),
                            ) => Some(result.unwrap_or_else(|_| Err(TransportError::Connect {
                                url: url.clone(),
                                reason: format!("handshake timed out after {:?}", self.config.connect_timeout),
                            }))),
                            _ = wait_for_shutdown(&mut shutdown) => None,
                        };
                        let event = match attempt {
                            None => ConnectionEvent::Shutdown,
                            Some(Ok(link)) => {
                                info!(exchange = %exchange, "exchange connected");
                                session = Some(link);
                                ping.reset();
                                ConnectionEvent::Connected
                            }
                            Some(Err(e)) => {
                                warn!(exchange = %exchange, error = %e, "connect failed");
                                ConnectionEvent::TransportFailed
                            }
                        };
                        pending.extend(machine.handle(event));
                    }
                    Action::ScheduleReconnect(delay) => {
                        EngineMetrics::incr(&self.metrics.reconnects);
                        info!(
                            exchange = %exchange,
                            attempt = machine.reconnect_attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "reconnect scheduled"
                        );
                        reconnect_at = Some(Instant::now() + delay);
                    }
                    Action::CancelReconnect => {
                        reconnect_at = None;
                    }
                    Action::ClearTracked => match &session {
                        Some(link) => self.tracker.begin_session(link.outbound.clone()).await,
                        None => self.tracker.clear().await,
                    },
                    Action::Reconcile => {
                        let reconciler = self.reconciler.clone();
                        tokio::spawn(async move {
                            for (kind, result) in reconciler.reconcile_all().await {
                                if let Err(e) = result {
                                    debug!(exchange = %reconciler.exchange(), kind = %kind, error = %e, "reconcile after connect failed");
                                }
                            }
                        });
                    }
                    Action::CloseTransport => {
                        if let Some(link) = session.take() {
                            if let Err(e) = link.outbound.try_send(OutboundFrame::Close) {
                                debug!(exchange = %exchange, error = %e, "close frame not queued");
                            }
                        }
                        self.tracker.end_session();
                        if machine.state() == ConnectionState::Closing {
                            pending.extend(machine.handle(ConnectionEvent::Closed));
                        }
                    }
                }
            }
            self.publish(machine.state());

            if machine.is_shutting_down() && machine.state() == ConnectionState::Disconnected {
                break;
            }

            let event = tokio::select! {
                changed = shutdown.changed(), if !machine.is_shutting_down() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Some(ConnectionEvent::Shutdown)
                    } else {
                        None
                    }
                }
                frame = next_inbound(&mut session) => match frame {
                    Some(InboundFrame::Text(text)) => {
                        self.dispatcher.on_message(&text).await;
                        None
                    }
                    Some(InboundFrame::Closed { code, reason }) => {
                        info!(exchange = %exchange, code = ?code, reason = %reason, "exchange closed the session");
                        Some(ConnectionEvent::Closed)
                    }
                    Some(InboundFrame::Error(error)) => {
                        warn!(exchange = %exchange, error = %error, "transport error");
                        Some(ConnectionEvent::TransportFailed)
                    }
                    None => {
                        warn!(exchange = %exchange, "inbound stream ended");
                        Some(ConnectionEvent::TransportFailed)
                    }
                },
                _ = ping.tick(), if machine.state() == ConnectionState::Connected => {
                    match session.as_ref().map(|link| link.outbound.try_send(self.adapter.ping_frame())) {
                        Some(Err(e)) => {
                            warn!(exchange = %exchange, error = %e, "keepalive ping rejected");
                            Some(ConnectionEvent::PingRejected)
                        }
                        _ => None,
                    }
                }
                _ = sleep_until_deadline(reconnect_at) => {
                    reconnect_at = None;
                    Some(ConnectionEvent::ReconnectDelayElapsed)
                }
            };
            if let Some(event) = event {
                pending.extend(machine.handle(event));
            }
        }

        self.publish(ConnectionState::Disconnected);
        info!(exchange = %exchange, "exchange connection stopped");
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn next_inbound(session: &mut Option<Link>) -> Option<InboundFrame> {
    match session {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
