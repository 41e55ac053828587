//! Realtime session: one duplex connection multiplexing every topic.
//!
//! A single background task owns the transport, the heartbeat timers, the
//! active subscriptions and the pending acks. The public handle talks to it
//! over a bounded command channel and observes its state through a watch
//! channel.

use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::ws::{WsConfig, WsConnector, WsSession};
use crate::exchanges::kucoin::codec::{KucoinCodec, KucoinRequest, TopicMessage, WsFrame};
use crate::exchanges::kucoin::token::TokenProvider;
use crate::exchanges::kucoin::types::ConnectionToken;
use futures_util::{FutureExt, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, trace, warn};

const COMMAND_BUFFER: usize = 64;
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);
/// Upper bound on frames handled while checking for a late pong
const MAX_DRAINED_FRAMES: usize = 1024;

/// Lifecycle of a realtime session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// One active topic subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Id of the most recent subscribe frame for this topic
    pub id: String,
    pub topic: String,
    pub private_channel: bool,
    pub response: bool,
}

impl Subscription {
    fn subscribe_request(&self, response: bool) -> KucoinRequest {
        KucoinRequest::Subscribe {
            id: self.id.clone(),
            topic: self.topic.clone(),
            private_channel: self.private_channel,
            response,
        }
    }

    fn unsubscribe_request(&self, id: String) -> KucoinRequest {
        KucoinRequest::Unsubscribe {
            id,
            topic: self.topic.clone(),
            private_channel: self.private_channel,
            response: false,
        }
    }
}

pub type TopicResult = Result<TopicMessage, ExchangeError>;

/// Messages for one subscription, in arrival order. Ends once the topic is
/// unsubscribed, replaced, or the session closes.
#[derive(Debug)]
pub struct TopicStream {
    topic: String,
    rx: mpsc::Receiver<TopicResult>,
}

impl TopicStream {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<TopicResult> {
        self.rx.recv().await
    }
}

impl Stream for TopicStream {
    type Item = TopicResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

type Reply = oneshot::Sender<Result<(), ExchangeError>>;

enum Command {
    Subscribe {
        topic: String,
        private_channel: bool,
        response: bool,
        events: mpsc::Sender<TopicResult>,
        result_tx: Reply,
    },
    Unsubscribe {
        topic: String,
        result_tx: Reply,
    },
    ActiveTopics {
        result_tx: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to a realtime session
///
/// Dropping the handle stops the session.
#[derive(Debug)]
pub struct RealtimeClient {
    commands: mpsc::Sender<Command>,
    stop: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    buffer_size: usize,
    _task: JoinHandle<()>,
}

impl RealtimeClient {
    /// Open a session on the token's preferred server and wait for the
    /// server's welcome. `provider` supplies fresh tokens for reconnects.
    #[instrument(skip_all, fields(exchange = "kucoin"))]
    pub async fn connect(
        token: ConnectionToken,
        provider: Arc<dyn TokenProvider>,
        connector: Arc<dyn WsConnector>,
        config: WsConfig,
    ) -> Result<Self, ExchangeError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        state_tx.send_replace(SessionState::Connecting);

        let codec = KucoinCodec::new();
        let conn = match establish(
            connector.as_ref(),
            &codec,
            &token,
            0,
            config.connect_timeout(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                state_tx.send_replace(SessionState::Closed);
                warn!(error = %e, "Realtime connect failed");
                return Err(e);
            }
        };

        info!(endpoint = %conn.endpoint, "Realtime session connected");
        state_tx.send_replace(SessionState::Connected);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let buffer_size = config.message_buffer_size.max(1);

        let actor = SessionTask {
            provider,
            connector,
            config,
            codec,
            commands: cmd_rx,
            stop: stop_rx,
            state: state_tx,
            id_seq: u64::from(rand::random::<u32>()),
            subs: HashMap::new(),
            pending_acks: HashMap::new(),
            replay: HashMap::new(),
            awaiting_pong: None,
        };
        let task = tokio::spawn(actor.run(conn));

        Ok(Self {
            commands: cmd_tx,
            stop: stop_tx,
            state: state_rx,
            buffer_size,
            _task: task,
        })
    }

    /// Subscribe to a topic. With `response` the call waits for the server's
    /// ack and fails on timeout; without it, it returns once the frame is
    /// sent. Issued while reconnecting, the subscribe is queued and replayed
    /// once connected.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        private_channel: bool,
        response: bool,
    ) -> Result<TopicStream, ExchangeError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "Topic must not be empty".to_string(),
            ));
        }

        let (events, rx) = mpsc::channel(self.buffer_size);
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            topic: topic.clone(),
            private_channel,
            response,
            events,
            result_tx,
        })
        .await?;

        result_rx.await.map_err(|_| ExchangeError::SessionClosed)??;
        Ok(TopicStream { topic, rx })
    }

    /// Drop a topic; does not wait for the server's ack
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), ExchangeError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            topic: topic.to_string(),
            result_tx,
        })
        .await?;

        result_rx.await.map_err(|_| ExchangeError::SessionClosed)?
    }

    /// Topics currently subscribed, sorted
    pub async fn active_topics(&self) -> Result<Vec<String>, ExchangeError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(Command::ActiveTopics { result_tx })
            .await?;
        result_rx.await.map_err(|_| ExchangeError::SessionClosed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Close the session. Pending subscribe waiters fail with `Cancelled`,
    /// including while a reconnect is in progress.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == SessionState::Closed)
            .await;
    }

    async fn send_command(&self, command: Command) -> Result<(), ExchangeError> {
        if self.state() == SessionState::Closed {
            return Err(ExchangeError::SessionClosed);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| ExchangeError::SessionClosed)
    }
}

struct Connection {
    session: Box<dyn WsSession>,
    endpoint: String,
    ping_interval: Duration,
    ping_timeout: Duration,
    next_ping: Instant,
}

/// Open the transport on the server picked for `attempt` and wait for the
/// welcome frame, all within `timeout`.
async fn establish(
    connector: &dyn WsConnector,
    codec: &KucoinCodec,
    token: &ConnectionToken,
    attempt: usize,
    timeout: Duration,
) -> Result<Connection, ExchangeError> {
    let server = token.server(attempt)?;
    let url = token.connect_url(server, &connect_id());
    let endpoint = server.endpoint.clone();
    debug!(endpoint = %endpoint, attempt, "Opening realtime connection");

    let session = tokio::time::timeout(timeout, open_session(connector, codec, &url))
        .await
        .map_err(|_| {
            ExchangeError::ConnectionTimeout(format!(
                "No welcome from {} within {}ms",
                endpoint,
                timeout.as_millis()
            ))
        })??;

    let ping_interval = Duration::from_millis(server.ping_interval.max(1));
    Ok(Connection {
        session,
        endpoint,
        ping_interval,
        ping_timeout: Duration::from_millis(server.ping_timeout.max(1)),
        next_ping: Instant::now() + ping_interval,
    })
}

async fn open_session(
    connector: &dyn WsConnector,
    codec: &KucoinCodec,
    url: &str,
) -> Result<Box<dyn WsSession>, ExchangeError> {
    let mut session = connector.connect(url).await?;
    loop {
        let message = match session.next_raw().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ExchangeError::NetworkError(
                    "Connection closed before welcome".to_string(),
                ))
            }
        };
        if let Message::Close(frame) = message {
            return Err(ExchangeError::NetworkError(format!(
                "Connection closed before welcome: {:?}",
                frame
            )));
        }
        match codec.decode_message(message)? {
            Some(WsFrame::Welcome { id }) => {
                debug!(id = %id, "Welcome received");
                return Ok(session);
            }
            Some(WsFrame::Error { code, message, .. }) => {
                return Err(ExchangeError::RealtimeError { code, message });
            }
            Some(other) => trace!(frame = ?other, "Ignoring frame before welcome"),
            None => {}
        }
    }
}

/// Reconnect path: every attempt starts from a fresh token
async fn reopen(
    provider: Arc<dyn TokenProvider>,
    connector: Arc<dyn WsConnector>,
    codec: KucoinCodec,
    attempt: usize,
    timeout: Duration,
) -> Result<Connection, ExchangeError> {
    let token = provider.fetch_token().await?;
    establish(connector.as_ref(), &codec, &token, attempt, timeout).await
}

fn connect_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Copy an error for fan-out to several receivers
fn replicate(err: &ExchangeError) -> ExchangeError {
    match err {
        ExchangeError::HeartbeatTimeout { timeout_ms } => ExchangeError::HeartbeatTimeout {
            timeout_ms: *timeout_ms,
        },
        ExchangeError::ReconnectFailed {
            attempts,
            last_error,
        } => ExchangeError::ReconnectFailed {
            attempts: *attempts,
            last_error: last_error.clone(),
        },
        ExchangeError::RealtimeError { code, message } => ExchangeError::RealtimeError {
            code: code.clone(),
            message: message.clone(),
        },
        ExchangeError::ProtocolError(message) => ExchangeError::ProtocolError(message.clone()),
        ExchangeError::ConnectionTimeout(message) => {
            ExchangeError::ConnectionTimeout(message.clone())
        }
        ExchangeError::Cancelled => ExchangeError::Cancelled,
        ExchangeError::SessionClosed => ExchangeError::SessionClosed,
        other => ExchangeError::NetworkError(other.to_string()),
    }
}

/// Resolves once stop is requested or the handle is dropped
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

enum Disruption {
    Stop,
    Lost(ExchangeError),
}

struct SubEntry {
    subscription: Subscription,
    events: mpsc::Sender<TopicResult>,
}

struct PendingAck {
    topic: String,
    deadline: Instant,
    result_tx: Reply,
}

struct SessionTask {
    provider: Arc<dyn TokenProvider>,
    connector: Arc<dyn WsConnector>,
    config: WsConfig,
    codec: KucoinCodec,
    commands: mpsc::Receiver<Command>,
    stop: watch::Receiver<bool>,
    state: watch::Sender<SessionState>,
    id_seq: u64,
    subs: HashMap<String, SubEntry>,
    /// Keyed by subscribe frame id
    pending_acks: HashMap<String, PendingAck>,
    /// Subscribe waiters to resolve after the next successful reconnect,
    /// keyed by topic
    replay: HashMap<String, Reply>,
    awaiting_pong: Option<(String, Instant)>,
}

impl SessionTask {
    async fn run(mut self, mut conn: Connection) {
        loop {
            let cause = match self.drive(&mut conn).await {
                Disruption::Stop => {
                    self.shutdown(Some(&mut conn)).await;
                    return;
                }
                Disruption::Lost(cause) => cause,
            };

            warn!(endpoint = %conn.endpoint, error = %cause, "Realtime connection lost");
            self.set_state(SessionState::Closing);
            let _ = tokio::time::timeout(self.config.connect_timeout(), conn.session.close()).await;
            self.park_pending_acks();

            let fatal = if self.config.auto_reconnect {
                match self.reconnect(cause).await {
                    Ok(next) => {
                        conn = next;
                        continue;
                    }
                    Err(Disruption::Stop) => {
                        self.shutdown(None).await;
                        return;
                    }
                    Err(Disruption::Lost(fatal)) => fatal,
                }
            } else {
                cause
            };

            error!(error = %fatal, "Realtime session failed");
            self.fail_waiters(&fatal);
            self.fail_streams(&fatal).await;
            self.shutdown(None).await;
            return;
        }
    }

    /// Serve one live connection until it is lost or stop is requested
    async fn drive(&mut self, conn: &mut Connection) -> Disruption {
        self.awaiting_pong = None;
        conn.next_ping = Instant::now() + conn.ping_interval;

        loop {
            let pong_deadline = self.awaiting_pong.as_ref().map(|(_, deadline)| *deadline);
            let ack_deadline = self.pending_acks.values().map(|ack| ack.deadline).min();
            let far_future = Instant::now() + FAR_FUTURE;

            tokio::select! {
                biased;

                _ = stopped(&mut self.stop) => return Disruption::Stop,

                _ = sleep_until(pong_deadline.unwrap_or(far_future)), if pong_deadline.is_some() => {
                    // The pong may be sitting unread behind a blocked delivery
                    if let Err(disruption) = self.drain_ready(conn).await {
                        return disruption;
                    }
                    if self.awaiting_pong.is_some() {
                        let timeout_ms = conn.ping_timeout.as_millis() as u64;
                        warn!(endpoint = %conn.endpoint, timeout_ms, "No pong from server");
                        self.set_state(SessionState::Closing);
                        return Disruption::Lost(ExchangeError::HeartbeatTimeout { timeout_ms });
                    }
                }

                _ = sleep_until(ack_deadline.unwrap_or(far_future)), if ack_deadline.is_some() => {
                    if let Err(disruption) = self.expire_acks(conn).await {
                        return disruption;
                    }
                }

                _ = sleep_until(conn.next_ping), if pong_deadline.is_none() => {
                    if let Err(e) = self.send_ping(conn).await {
                        return Disruption::Lost(e);
                    }
                }

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(disruption) = self.handle_command(conn, command).await {
                            return disruption;
                        }
                    }
                    None => return Disruption::Stop,
                },

                frame = conn.session.next_raw() => match frame {
                    Some(Ok(message)) => {
                        if let Err(disruption) = self.handle_frame(conn, message).await {
                            return disruption;
                        }
                    }
                    Some(Err(e)) => return Disruption::Lost(e),
                    None => {
                        return Disruption::Lost(ExchangeError::NetworkError(
                            "Connection closed by peer".to_string(),
                        ))
                    }
                },
            }
        }
    }

    async fn handle_command(
        &mut self,
        conn: &mut Connection,
        command: Command,
    ) -> Result<(), Disruption> {
        match command {
            Command::Subscribe {
                topic,
                private_channel,
                response,
                events,
                result_tx,
            } => {
                let subscription = Subscription {
                    id: self.next_id(),
                    topic: topic.clone(),
                    private_channel,
                    response,
                };
                let request = subscription.subscribe_request(response);
                let id = subscription.id.clone();
                self.insert_subscription(subscription, events);

                let sent = self.send(conn, request).await;
                debug!(id = %id, topic = %topic, "Subscribe sent");
                if response {
                    self.pending_acks.insert(
                        id,
                        PendingAck {
                            topic,
                            deadline: Instant::now() + self.config.ack_timeout(),
                            result_tx,
                        },
                    );
                } else {
                    let _ = result_tx.send(Ok(()));
                }
                sent.map_err(Disruption::Lost)
            }
            Command::Unsubscribe { topic, result_tx } => {
                let removed = self.subs.remove(&topic);
                let _ = result_tx.send(Ok(()));
                if let Some(entry) = removed {
                    let id = self.next_id();
                    debug!(id = %id, topic = %topic, "Unsubscribe sent");
                    self.send(conn, entry.subscription.unsubscribe_request(id))
                        .await
                        .map_err(Disruption::Lost)?;
                }
                Ok(())
            }
            Command::ActiveTopics { result_tx } => {
                let _ = result_tx.send(self.topics());
                Ok(())
            }
        }
    }

    /// Commands arriving while no connection is up: subscription changes are
    /// recorded and applied by the next resubscribe
    fn handle_offline_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                topic,
                private_channel,
                response,
                events,
                result_tx,
            } => {
                debug!(topic = %topic, "Queueing subscribe until reconnected");
                let subscription = Subscription {
                    id: self.next_id(),
                    topic: topic.clone(),
                    private_channel,
                    response,
                };
                self.insert_subscription(subscription, events);
                if response {
                    self.queue_replay(topic, result_tx);
                } else {
                    let _ = result_tx.send(Ok(()));
                }
            }
            Command::Unsubscribe { topic, result_tx } => {
                self.subs.remove(&topic);
                if let Some(waiter) = self.replay.remove(&topic) {
                    let _ = waiter.send(Err(ExchangeError::Cancelled));
                }
                let _ = result_tx.send(Ok(()));
            }
            Command::ActiveTopics { result_tx } => {
                let _ = result_tx.send(self.topics());
            }
        }
    }

    async fn handle_frame(
        &mut self,
        conn: &mut Connection,
        message: Message,
    ) -> Result<(), Disruption> {
        if let Message::Close(frame) = message {
            return Err(Disruption::Lost(ExchangeError::NetworkError(format!(
                "Server closed connection: {:?}",
                frame
            ))));
        }

        let frame = match self.codec.decode_message(message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Undecodable realtime frame");
                self.broadcast(&e);
                return Ok(());
            }
        };

        match frame {
            WsFrame::Welcome { id } => debug!(id = %id, "Ignoring repeated welcome"),
            WsFrame::Ping { id } => {
                trace!(id = %id, "Answering server ping");
                self.send(conn, KucoinRequest::Pong { id })
                    .await
                    .map_err(Disruption::Lost)?;
            }
            WsFrame::Pong { id } => {
                if self
                    .awaiting_pong
                    .as_ref()
                    .is_some_and(|(expected, _)| *expected == id)
                {
                    trace!(id = %id, "Pong received");
                    self.awaiting_pong = None;
                } else {
                    trace!(id = %id, "Ignoring unmatched pong");
                }
            }
            WsFrame::Ack { id } => match self.pending_acks.remove(&id) {
                Some(ack) => {
                    debug!(id = %id, topic = %ack.topic, "Subscription acknowledged");
                    let _ = ack.result_tx.send(Ok(()));
                }
                None => trace!(id = %id, "Ack without waiter"),
            },
            WsFrame::Message(message) => self.route(conn, message).await?,
            WsFrame::Error { id, code, message } => {
                let ack = id.as_ref().and_then(|id| self.pending_acks.remove(id));
                match (id, ack) {
                    (Some(id), Some(ack)) => {
                        warn!(id = %id, topic = %ack.topic, code = %code, "Subscribe rejected: {}", message);
                        self.remove_if_current(&ack.topic, &id);
                        let _ = ack
                            .result_tx
                            .send(Err(ExchangeError::RealtimeError { code, message }));
                    }
                    _ => {
                        warn!(code = %code, "Realtime error frame: {}", message);
                        self.broadcast(&ExchangeError::RealtimeError { code, message });
                    }
                }
            }
        }
        Ok(())
    }

    /// Deliver to the matching subscription, waiting for queue space
    async fn route(
        &mut self,
        conn: &mut Connection,
        message: TopicMessage,
    ) -> Result<(), Disruption> {
        let Some(key) = self.route_key(&message.topic) else {
            trace!(topic = %message.topic, "Dropping message for inactive topic");
            return Ok(());
        };
        let Some(events) = self.subs.get(&key).map(|entry| entry.events.clone()) else {
            return Ok(());
        };

        // Keep pinging while the consumer catches up; frames stay queued in
        // the transport until the delivery completes
        let permit = loop {
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return Err(Disruption::Stop),
                permit = events.reserve() => break permit.ok(),
                _ = sleep_until(conn.next_ping), if self.awaiting_pong.is_none() => {
                    self.send_ping(conn).await.map_err(Disruption::Lost)?;
                }
            }
        };
        if let Some(permit) = permit {
            permit.send(Ok(message));
            return Ok(());
        }

        let consumer_gone = self
            .subs
            .get(&key)
            .is_some_and(|entry| entry.events.same_channel(&events));
        if consumer_gone {
            if let Some(entry) = self.subs.remove(&key) {
                let id = self.next_id();
                debug!(topic = %key, "Consumer dropped its stream, unsubscribing");
                self.send(conn, entry.subscription.unsubscribe_request(id))
                    .await
                    .map_err(Disruption::Lost)?;
            }
        }
        Ok(())
    }

    /// Exact topic first, then a multi-symbol subscription listing the
    /// symbol, then the `all` subscription for the topic prefix
    fn route_key(&self, topic: &str) -> Option<String> {
        if self.subs.contains_key(topic) {
            return Some(topic.to_string());
        }

        let (prefix, symbol) = topic.split_once(':')?;
        let listed = self
            .subs
            .keys()
            .filter(|key| match key.split_once(':') {
                Some((key_prefix, symbols)) if key_prefix == prefix => {
                    symbols.split(',').any(|s| s == symbol)
                }
                _ => false,
            })
            .min();
        if let Some(key) = listed {
            return Some(key.clone());
        }

        let all = format!("{}:all", prefix);
        self.subs.contains_key(&all).then_some(all)
    }

    /// Handle frames the transport already holds, without waiting for more,
    /// until the outstanding pong is matched
    async fn drain_ready(&mut self, conn: &mut Connection) -> Result<(), Disruption> {
        for _ in 0..MAX_DRAINED_FRAMES {
            if self.awaiting_pong.is_none() {
                break;
            }
            let Some(frame) = conn.session.next_raw().now_or_never() else {
                break;
            };
            match frame {
                Some(Ok(message)) => self.handle_frame(conn, message).await?,
                Some(Err(e)) => return Err(Disruption::Lost(e)),
                None => {
                    return Err(Disruption::Lost(ExchangeError::NetworkError(
                        "Connection closed by peer".to_string(),
                    )))
                }
            }
        }
        Ok(())
    }

    async fn expire_acks(&mut self, conn: &mut Connection) -> Result<(), Disruption> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending_acks
            .iter()
            .filter(|(_, ack)| ack.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            let Some(ack) = self.pending_acks.remove(&id) else {
                continue;
            };
            warn!(id = %id, topic = %ack.topic, "Subscribe ack timed out");
            let removed = self.remove_if_current(&ack.topic, &id);
            let _ = ack.result_tx.send(Err(ExchangeError::AckTimeout {
                id,
                topic: ack.topic,
            }));

            if let Some(entry) = removed {
                let unsubscribe_id = self.next_id();
                self.send(conn, entry.subscription.unsubscribe_request(unsubscribe_id))
                    .await
                    .map_err(Disruption::Lost)?;
            }
        }
        Ok(())
    }

    /// Bounded reconnect loop: fresh token and the next ranked server on
    /// every attempt
    async fn reconnect(&mut self, cause: ExchangeError) -> Result<Connection, Disruption> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut last_error = cause.to_string();

        for attempt in 1..=max_attempts {
            self.set_state(SessionState::Connecting);
            let delay = self.config.reconnect_delay(attempt);
            info!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.wait_offline(delay).await?;

            match self.try_reconnect(attempt).await {
                Ok(conn) => {
                    info!(attempt, endpoint = %conn.endpoint, "Reconnected");
                    self.set_state(SessionState::Connected);
                    return Ok(conn);
                }
                Err(Disruption::Stop) => return Err(Disruption::Stop),
                Err(Disruption::Lost(e)) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(Disruption::Lost(ExchangeError::ReconnectFailed {
            attempts: max_attempts,
            last_error,
        }))
    }

    /// Sleep out a reconnect delay while still serving commands
    async fn wait_offline(&mut self, delay: Duration) -> Result<(), Disruption> {
        let delay = sleep(delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return Err(Disruption::Stop),
                () = &mut delay => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_offline_command(command),
                    None => return Err(Disruption::Stop),
                },
            }
        }
    }

    async fn try_reconnect(&mut self, attempt: u32) -> Result<Connection, Disruption> {
        self.park_pending_acks();

        let open = reopen(
            Arc::clone(&self.provider),
            Arc::clone(&self.connector),
            self.codec,
            attempt as usize,
            self.config.connect_timeout(),
        );

        let mut conn = tokio::select! {
            biased;
            _ = stopped(&mut self.stop) => return Err(Disruption::Stop),
            opened = open => opened.map_err(Disruption::Lost)?,
        };

        self.resubscribe_all(&mut conn)
            .await
            .map_err(Disruption::Lost)?;
        Ok(conn)
    }

    /// Send a subscribe with a fresh id for every active topic; queued
    /// waiters get their ack tracked again
    async fn resubscribe_all(&mut self, conn: &mut Connection) -> Result<(), ExchangeError> {
        let topics = self.topics();
        info!(count = topics.len(), "Re-subscribing active topics");
        let deadline = Instant::now() + self.config.ack_timeout();

        for topic in topics {
            let id = self.next_id();
            let waiter = self.replay.remove(&topic);
            let Some(entry) = self.subs.get_mut(&topic) else {
                continue;
            };
            entry.subscription.id = id.clone();
            let request = entry.subscription.subscribe_request(waiter.is_some());

            if let Some(result_tx) = waiter {
                self.pending_acks.insert(
                    id.clone(),
                    PendingAck {
                        topic: topic.clone(),
                        deadline,
                        result_tx,
                    },
                );
            }
            debug!(id = %id, topic = %topic, "Re-subscribe sent");
            self.send(conn, request).await?;
        }

        for (_, waiter) in self.replay.drain() {
            let _ = waiter.send(Err(ExchangeError::Cancelled));
        }
        Ok(())
    }

    /// Move acks of the lost connection to the replay set
    fn park_pending_acks(&mut self) {
        let pending: Vec<(String, PendingAck)> = self.pending_acks.drain().collect();
        for (id, ack) in pending {
            match self.subs.get(&ack.topic) {
                Some(entry) if entry.subscription.id == id => {
                    self.queue_replay(ack.topic, ack.result_tx);
                }
                // Replaced by a newer subscribe; that one's stream now owns the topic
                Some(_) => {
                    let _ = ack.result_tx.send(Ok(()));
                }
                None => {
                    let _ = ack.result_tx.send(Err(ExchangeError::Cancelled));
                }
            }
        }
    }

    fn queue_replay(&mut self, topic: String, result_tx: Reply) {
        if let Some(replaced) = self.replay.insert(topic, result_tx) {
            let _ = replaced.send(Ok(()));
        }
    }

    fn insert_subscription(&mut self, subscription: Subscription, events: mpsc::Sender<TopicResult>) {
        let topic = subscription.topic.clone();
        if self
            .subs
            .insert(topic.clone(), SubEntry { subscription, events })
            .is_some()
        {
            debug!(topic = %topic, "Replaced existing subscription");
        }
    }

    fn remove_if_current(&mut self, topic: &str, id: &str) -> Option<SubEntry> {
        if self
            .subs
            .get(topic)
            .is_some_and(|entry| entry.subscription.id == id)
        {
            self.subs.remove(topic)
        } else {
            None
        }
    }

    /// Non-blocking error fan-out; full queues miss the error
    fn broadcast(&self, err: &ExchangeError) {
        for entry in self.subs.values() {
            let _ = entry.events.try_send(Err(replicate(err)));
        }
    }

    fn fail_waiters(&mut self, err: &ExchangeError) {
        for (_, ack) in self.pending_acks.drain() {
            let _ = ack.result_tx.send(Err(replicate(err)));
        }
        for (_, waiter) in self.replay.drain() {
            let _ = waiter.send(Err(replicate(err)));
        }
    }

    /// Terminal error to every stream; the streams end afterwards
    async fn fail_streams(&mut self, err: &ExchangeError) {
        let entries: Vec<SubEntry> = self.subs.drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return,
                _ = entry.events.send(Err(replicate(err))) => {}
            }
        }
    }

    async fn shutdown(&mut self, conn: Option<&mut Connection>) {
        self.set_state(SessionState::Closing);
        if let Some(conn) = conn {
            let _ = tokio::time::timeout(self.config.connect_timeout(), conn.session.close()).await;
        }

        for (_, ack) in self.pending_acks.drain() {
            let _ = ack.result_tx.send(Err(ExchangeError::Cancelled));
        }
        for (_, waiter) in self.replay.drain() {
            let _ = waiter.send(Err(ExchangeError::Cancelled));
        }
        self.subs.clear();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Subscribe { result_tx, .. } | Command::Unsubscribe { result_tx, .. } => {
                    let _ = result_tx.send(Err(ExchangeError::Cancelled));
                }
                Command::ActiveTopics { result_tx } => {
                    let _ = result_tx.send(Vec::new());
                }
            }
        }

        self.set_state(SessionState::Closed);
        info!("Realtime session closed");
    }

    async fn send_ping(&mut self, conn: &mut Connection) -> Result<(), ExchangeError> {
        let id = self.next_id();
        self.send(conn, KucoinRequest::Ping { id: id.clone() }).await?;
        trace!(id = %id, "Ping sent");
        let now = Instant::now();
        self.awaiting_pong = Some((id, now + conn.ping_timeout));
        conn.next_ping = now + conn.ping_interval;
        Ok(())
    }

    async fn send(&self, conn: &mut Connection, request: KucoinRequest) -> Result<(), ExchangeError> {
        let message = self.codec.encode(&request)?;
        conn.session.send_raw(message).await
    }

    fn next_id(&mut self) -> String {
        self.id_seq = self.id_seq.wrapping_add(1);
        self.id_seq.to_string()
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subs.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Session state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_topics(topics: &[&str]) -> (SessionTask, Vec<mpsc::Receiver<TopicResult>>) {
        struct NoTokens;
        #[async_trait::async_trait]
        impl TokenProvider for NoTokens {
            async fn fetch_token(&self) -> Result<ConnectionToken, ExchangeError> {
                Err(ExchangeError::NetworkError("offline".to_string()))
            }
        }
        struct NoConnect;
        #[async_trait::async_trait]
        impl WsConnector for NoConnect {
            async fn connect(&self, _url: &str) -> Result<Box<dyn WsSession>, ExchangeError> {
                Err(ExchangeError::NetworkError("offline".to_string()))
            }
        }

        let (_cmd_tx, commands) = mpsc::channel(1);
        let (_stop_tx, stop) = watch::channel(false);
        let (state, _state_rx) = watch::channel(SessionState::Connected);
        let mut task = SessionTask {
            provider: Arc::new(NoTokens),
            connector: Arc::new(NoConnect),
            config: WsConfig::default(),
            codec: KucoinCodec::new(),
            commands,
            stop,
            state,
            id_seq: 0,
            subs: HashMap::new(),
            pending_acks: HashMap::new(),
            replay: HashMap::new(),
            awaiting_pong: None,
        };

        let mut receivers = Vec::new();
        for topic in topics {
            let (events, rx) = mpsc::channel(4);
            let subscription = Subscription {
                id: task.next_id(),
                topic: (*topic).to_string(),
                private_channel: false,
                response: false,
            };
            task.insert_subscription(subscription, events);
            receivers.push(rx);
        }
        (task, receivers)
    }

    #[test]
    fn test_route_key_exact_match_wins() {
        let (task, _rx) = task_with_topics(&["/market/ticker:BTC-USDT", "/market/ticker:all"]);
        assert_eq!(
            task.route_key("/market/ticker:BTC-USDT").as_deref(),
            Some("/market/ticker:BTC-USDT")
        );
        assert_eq!(
            task.route_key("/market/ticker:ETH-USDT").as_deref(),
            Some("/market/ticker:all")
        );
    }

    #[test]
    fn test_route_key_multi_symbol() {
        let (task, _rx) = task_with_topics(&["/market/match:BTC-USDT,ETH-USDT"]);
        assert_eq!(
            task.route_key("/market/match:ETH-USDT").as_deref(),
            Some("/market/match:BTC-USDT,ETH-USDT")
        );
        assert!(task.route_key("/market/match:XRP-USDT").is_none());
        assert!(task.route_key("/market/level2:ETH-USDT").is_none());
        assert!(task.route_key("/account/balance").is_none());
    }

    #[test]
    fn test_route_key_prefers_symbol_list_over_all() {
        for topics in [
            ["/market/ticker:all", "/market/ticker:BTC-USDT,ETH-USDT"],
            ["/market/ticker:BTC-USDT,ETH-USDT", "/market/ticker:all"],
        ] {
            let (task, _rx) = task_with_topics(&topics);
            for _ in 0..8 {
                assert_eq!(
                    task.route_key("/market/ticker:ETH-USDT").as_deref(),
                    Some("/market/ticker:BTC-USDT,ETH-USDT")
                );
            }
            assert_eq!(
                task.route_key("/market/ticker:XRP-USDT").as_deref(),
                Some("/market/ticker:all")
            );
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let (mut task, _rx) = task_with_topics(&[]);
        let a = task.next_id();
        let b = task.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_broadcast_does_not_block_on_full_queue() {
        let (task, mut receivers) = task_with_topics(&["/a", "/b"]);
        for _ in 0..10 {
            task.broadcast(&ExchangeError::ProtocolError("bad frame".to_string()));
        }
        let first = receivers[0].try_recv().unwrap();
        assert!(matches!(first, Err(ExchangeError::ProtocolError(_))));
    }

    #[test]
    fn test_park_pending_acks() {
        let (mut task, _rx) = task_with_topics(&["/a"]);
        let current_id = task.subs["/a"].subscription.id.clone();

        let (current_tx, mut current_rx) = oneshot::channel();
        let (stale_tx, mut stale_rx) = oneshot::channel();
        let (gone_tx, mut gone_rx) = oneshot::channel();
        let deadline = Instant::now();
        for (id, topic, result_tx) in [
            (current_id, "/a", current_tx),
            ("old".to_string(), "/a", stale_tx),
            ("x".to_string(), "/gone", gone_tx),
        ] {
            task.pending_acks.insert(
                id,
                PendingAck {
                    topic: topic.to_string(),
                    deadline,
                    result_tx,
                },
            );
        }

        task.park_pending_acks();

        assert!(task.pending_acks.is_empty());
        assert!(task.replay.contains_key("/a"));
        assert!(current_rx.try_recv().is_err());
        assert!(matches!(stale_rx.try_recv(), Ok(Ok(()))));
        assert!(matches!(gone_rx.try_recv(), Ok(Err(ExchangeError::Cancelled))));
    }

    #[test]
    fn test_replicate_keeps_variant() {
        let copy = replicate(&ExchangeError::HeartbeatTimeout { timeout_ms: 10 });
        assert!(matches!(copy, ExchangeError::HeartbeatTimeout { timeout_ms: 10 }));
        let copy = replicate(&ExchangeError::InvalidParameters("x".to_string()));
        assert!(matches!(copy, ExchangeError::NetworkError(_)));
    }
}
