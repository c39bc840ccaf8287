//! Persistent connection to the calculation backend.
//!
//! [`Connection`] is a cheap, cloneable handle. State lives in a
//! [`ConnectionMachine`] behind a mutex that is never held across an await;
//! every socket event and timer is processed by one background driver task,
//! so handler callbacks never overlap.
//!
//! ```text
//!   Connection (handle) ──effects──▶ driver task ──▶ Socket (Transport)
//!          │                              │
//!          └────── ConnectionMachine ◀────┘
//!                                         │
//!                                         ▼
//!                                 ConnectionHandler
//! ```

pub mod state;
pub mod transport;

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::protocol::{self, InboundFrame, InboundMessage, OutboundMessage};

pub use state::{ConnectionMachine, ConnectionState, Effect, Input, ReconnectPolicy, TransitionError};
pub use transport::{
    memory_transport, MemoryPeer, MemoryServer, MemoryTransport, Outgoing, Socket, SocketEvent,
    Transport, TransportError, WebSocketTransport,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("Connection attempt already in progress ({0})")]
    InProgress(ConnectionState),

    #[error("Connection has been destroyed")]
    Destroyed,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection attempt aborted")]
    Aborted,
}

impl From<TransitionError> for ConnectError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::InProgress(state) => ConnectError::InProgress(state),
            TransitionError::Destroyed => ConnectError::Destroyed,
            TransitionError::Invalid { state, .. } => ConnectError::InProgress(state),
        }
    }
}

/// Receives everything the connection observes. Called from the driver task
/// only, one call at a time.
pub trait ConnectionHandler: Send + Sync {
    fn on_frame(&self, frame: InboundFrame);

    fn on_state_change(&self, from: ConnectionState, to: ConnectionState);

    /// Reconnection gave up; the connection stays `Disconnected` until the
    /// next explicit `connect()`.
    fn on_connection_lost(&self, attempts: u32);
}

enum Command {
    Apply(Vec<Effect>),
    Shutdown,
}

struct Shared {
    machine: ConnectionMachine,
    handler: Option<Arc<dyn ConnectionHandler>>,
    pending_connect: Option<oneshot::Sender<Result<(), ConnectError>>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the persistent connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::UnboundedSender<Command>,
    outbound: mpsc::UnboundedSender<String>,
    config: Arc<ConnectionConfig>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a connection and spawn its driver. Does not connect yet.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(Mutex::new(Shared {
            machine: ConnectionMachine::new(ReconnectPolicy::from(config.as_ref())),
            handler: None,
            pending_connect: None,
        }));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let driver = Driver {
            shared: shared.clone(),
            transport,
            config: config.clone(),
            commands: commands_rx,
            outbound: outbound_rx,
            socket: None,
            opening: None,
            heartbeat: None,
            reconnect: None,
            liveness: None,
            resubscribe: VecDeque::new(),
            resubscribe_timer: None,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run());

        Self {
            shared,
            commands: commands_tx,
            outbound: outbound_tx,
            config,
            shutdown,
        }
    }

    /// Open the channel and wait for the handshake.
    ///
    /// Succeeds immediately if already open (the handler is still replaced).
    ///
    /// # Errors
    /// - `InProgress` if a connect or reconnect is already in flight
    /// - `InvalidEndpoint`, `Transport`, `Timeout` for genuine socket failures;
    ///   automatic reconnection still proceeds in the background
    /// - `Aborted` if `disconnect()` was called before the handshake finished
    pub async fn connect(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), ConnectError> {
        self.config
            .endpoint()
            .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?;

        let ready = {
            let mut shared = lock(&self.shared);
            let effects = shared.machine.handle(Input::Connect)?;
            shared.handler = Some(handler);
            if effects.is_empty() {
                debug!("connect() while already open");
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            if let Some(stale) = shared.pending_connect.replace(tx) {
                let _ = stale.send(Err(ConnectError::Aborted));
            }
            self.apply(effects);
            rx
        };

        ready.await.unwrap_or(Err(ConnectError::Aborted))
    }

    /// Operator-initiated close: suppresses auto-reconnect, cancels every
    /// timer, closes the channel and clears the subscription set.
    pub fn disconnect(&self) {
        let mut shared = lock(&self.shared);
        match shared.machine.handle(Input::Disconnect) {
            Ok(effects) => {
                if let Some(pending) = shared.pending_connect.take() {
                    let _ = pending.send(Err(ConnectError::Aborted));
                }
                info!("Disconnecting from {}", self.config.url);
                self.apply(effects);
            }
            Err(e) => debug!("disconnect() ignored: {}", e),
        }
    }

    /// `disconnect()` plus stopping the driver. The handle is unusable afterwards.
    pub fn destroy(&self) {
        {
            let mut shared = lock(&self.shared);
            if let Ok(effects) = shared.machine.handle(Input::Destroy) {
                if let Some(pending) = shared.pending_connect.take() {
                    let _ = pending.send(Err(ConnectError::Destroyed));
                }
                self.apply(effects);
            }
            shared.handler = None;
        }
        let _ = self.commands.send(Command::Shutdown);
        self.shutdown.cancel();
    }

    /// Serialize and transmit `message` iff the connection is open.
    ///
    /// Returns `false` (and logs) otherwise; never fails loudly.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let shared = lock(&self.shared);
        self.send_locked(&shared, message)
    }

    fn send_locked(&self, shared: &Shared, message: &OutboundMessage) -> bool {
        if !shared.machine.is_open() {
            warn!(
                "Cannot send '{}': connection is {}",
                message.kind(),
                shared.machine.state()
            );
            return false;
        }
        match message.encode() {
            Ok(text) => self.outbound.send(text).is_ok(),
            Err(e) => {
                error!("Failed to encode '{}': {}", message.kind(), e);
                false
            }
        }
    }

    /// Add `task_id` to the subscription set and send `subscribe_task` if open.
    ///
    /// Returns whether the frame was sent. The id stays in the set either
    /// way and is resubscribed on the next open.
    pub fn subscribe_to_task(&self, task_id: &str) -> bool {
        let mut shared = lock(&self.shared);
        shared.machine.add_subscription(task_id);
        if !shared.machine.is_open() {
            debug!(task_id = %task_id, "Subscription queued until connection opens");
            return false;
        }
        self.send_locked(
            &shared,
            &OutboundMessage::SubscribeTask {
                task_id: task_id.to_string(),
            },
        )
    }

    /// Remove `task_id` from the subscription set and send `unsubscribe_task`
    /// if open. Returns whether the id was subscribed.
    pub fn unsubscribe_from_task(&self, task_id: &str) -> bool {
        let mut shared = lock(&self.shared);
        let removed = shared.machine.remove_subscription(task_id);
        if removed && shared.machine.is_open() {
            self.send_locked(
                &shared,
                &OutboundMessage::UnsubscribeTask {
                    task_id: task_id.to_string(),
                },
            );
        }
        removed
    }

    /// Ask the backend for the current status of `task_id`.
    pub fn request_task_status(&self, task_id: &str) -> bool {
        self.send(&OutboundMessage::GetTaskStatus {
            task_id: task_id.to_string(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).machine.state()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared).machine.is_open()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared).machine.subscriptions().cloned().collect()
    }

    pub fn is_subscribed(&self, task_id: &str) -> bool {
        lock(&self.shared).machine.is_subscribed(task_id)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.shared).machine.reconnect_attempts()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn apply(&self, effects: Vec<Effect>) {
        if self.commands.send(Command::Apply(effects)).is_err() {
            warn!("Connection driver has stopped; dropping effects");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

struct Driver {
    shared: Arc<Mutex<Shared>>,
    transport: Arc<dyn Transport>,
    config: Arc<ConnectionConfig>,
    commands: mpsc::UnboundedReceiver<Command>,
    outbound: mpsc::UnboundedReceiver<String>,
    socket: Option<Socket>,
    opening: Option<BoxFuture<'static, Result<Socket, ConnectError>>>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    liveness: Option<Pin<Box<Sleep>>>,
    resubscribe: VecDeque<String>,
    resubscribe_timer: Option<Pin<Box<Sleep>>>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Apply(effects)) => self.apply(effects),
                    Some(Command::Shutdown) | None => break,
                },
                result = poll_opening(&mut self.opening) => {
                    self.opening = None;
                    self.on_open_result(result);
                }
                event = recv_socket(&mut self.socket) => self.on_socket_event(event),
                Some(text) = self.outbound.recv() => self.write(text),
                _ = tick(&mut self.heartbeat) => self.on_heartbeat(),
                _ = wait(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.input(Input::ReconnectTimerFired);
                }
                _ = wait(&mut self.liveness) => {
                    self.liveness = None;
                    warn!("No frame received within the liveness window");
                    self.input(Input::LivenessExpired);
                }
                _ = wait(&mut self.resubscribe_timer) => {
                    self.resubscribe_timer = None;
                    self.resubscribe_next();
                }
            }
        }

        if let Some(socket) = self.socket.take() {
            let _ = socket.outbound.send(Outgoing::Close);
        }
        debug!("Connection driver stopped");
    }

    fn input(&mut self, input: Input) {
        let effects = match lock(&self.shared).machine.handle(input) {
            Ok(effects) => effects,
            Err(e) => {
                debug!("Ignoring connection input: {}", e);
                return;
            }
        };
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenTransport => self.open_transport(),
                Effect::CloseTransport => {
                    self.opening = None;
                    self.liveness = None;
                    if let Some(socket) = self.socket.take() {
                        let _ = socket.outbound.send(Outgoing::Close);
                    }
                }
                Effect::StartHeartbeat => {
                    let period = self.config.heartbeat_interval();
                    if period.is_zero() {
                        debug!("Heartbeat disabled");
                        continue;
                    }
                    let Some(start) = Instant::now().checked_add(period) else {
                        warn!(?period, "Heartbeat interval out of range; heartbeat disabled");
                        continue;
                    };
                    let mut heartbeat = interval_at(start, period);
                    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(heartbeat);
                }
                Effect::StopHeartbeat => {
                    self.heartbeat = None;
                    self.liveness = None;
                }
                Effect::ScheduleReconnect { attempt, delay } => {
                    info!(
                        attempt,
                        max_attempts = self.config.max_reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );
                    self.reconnect = Some(Box::pin(sleep(delay)));
                }
                Effect::CancelReconnect => self.reconnect = None,
                Effect::Resubscribe(task_ids) => {
                    info!("Resubscribing to {} task(s)", task_ids.len());
                    self.resubscribe = task_ids.into();
                    self.resubscribe_next();
                }
                Effect::CancelResubscribe => {
                    self.resubscribe.clear();
                    self.resubscribe_timer = None;
                }
                Effect::StateChanged { from, to } => {
                    let handler = {
                        let mut shared = lock(&self.shared);
                        if to == ConnectionState::Open {
                            if let Some(pending) = shared.pending_connect.take() {
                                let _ = pending.send(Ok(()));
                            }
                        }
                        shared.handler.clone()
                    };
                    info!("Connection {} -> {}", from, to);
                    if let Some(handler) = handler {
                        handler.on_state_change(from, to);
                    }
                }
                Effect::ConnectionLost { attempts } => {
                    warn!(
                        attempts,
                        "Giving up on {} after {} reconnect attempts", self.config.url, attempts
                    );
                    let handler = lock(&self.shared).handler.clone();
                    if let Some(handler) = handler {
                        handler.on_connection_lost(attempts);
                    }
                }
            }
        }
    }

    fn open_transport(&mut self) {
        let transport = self.transport.clone();
        let config = self.config.clone();
        info!("Connecting to {}", config.url);
        self.opening = Some(Box::pin(async move {
            let url = config
                .endpoint()
                .map_err(|e| ConnectError::InvalidEndpoint(e.to_string()))?;
            let limit = config.connect_timeout();
            match timeout(limit, transport.open(&url, config.token.as_deref())).await {
                Ok(Ok(socket)) => Ok(socket),
                Ok(Err(e)) => Err(ConnectError::Transport(e.to_string())),
                Err(_) => Err(ConnectError::Timeout(limit)),
            }
        }));
    }

    fn on_open_result(&mut self, result: Result<Socket, ConnectError>) {
        match result {
            Ok(socket) => {
                let effects = match lock(&self.shared).machine.handle(Input::Opened) {
                    Ok(effects) => effects,
                    Err(e) => {
                        debug!("Discarding socket opened after state change: {}", e);
                        let _ = socket.outbound.send(Outgoing::Close);
                        return;
                    }
                };
                self.socket = Some(socket);
                self.apply(effects);
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                if let Some(pending) = lock(&self.shared).pending_connect.take() {
                    let _ = pending.send(Err(e));
                }
                self.input(Input::OpenFailed);
            }
        }
    }

    fn on_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Text(text)) => {
                self.liveness = None;
                let frame = match protocol::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping malformed frame: {}", e);
                        return;
                    }
                };
                if let InboundMessage::Unknown { kind } = &frame.message {
                    warn!(kind = %kind, "Unknown frame type; not routed to any task");
                }
                let handler = lock(&self.shared).handler.clone();
                if let Some(handler) = handler {
                    handler.on_frame(frame);
                }
            }
            Some(SocketEvent::Closed { clean, reason }) => {
                self.socket = None;
                info!(
                    clean,
                    reason = reason.as_deref().unwrap_or(""),
                    "Connection closed by peer"
                );
                self.input(Input::Closed { clean });
            }
            None => {
                self.socket = None;
                self.input(Input::Closed { clean: false });
            }
        }
    }

    fn on_heartbeat(&mut self) {
        if self.socket.is_none() {
            return;
        }
        match OutboundMessage::Ping.encode() {
            Ok(text) => self.write(text),
            Err(e) => error!("Failed to encode ping: {}", e),
        }
        if self.liveness.is_none() {
            if let Some(window) = self.config.pong_timeout() {
                self.liveness = Some(Box::pin(sleep(window)));
            }
        }
    }

    fn resubscribe_next(&mut self) {
        while let Some(task_id) = self.resubscribe.pop_front() {
            let still_wanted = {
                let shared = lock(&self.shared);
                shared.machine.is_open() && shared.machine.is_subscribed(&task_id)
            };
            if !still_wanted {
                continue;
            }

            let message = OutboundMessage::SubscribeTask { task_id };
            match message.encode() {
                Ok(text) => self.write(text),
                Err(e) => error!("Failed to encode resubscribe: {}", e),
            }

            let stagger = self.config.resubscribe_stagger();
            if !self.resubscribe.is_empty() && !stagger.is_zero() {
                self.resubscribe_timer = Some(Box::pin(sleep(stagger)));
                return;
            }
        }
    }

    fn write(&mut self, text: String) {
        match &self.socket {
            Some(socket) => {
                if socket.outbound.send(Outgoing::Text(text)).is_err() {
                    debug!("Socket writer has stopped; frame dropped");
                }
            }
            None => debug!("No open socket; frame dropped"),
        }
    }
}

async fn poll_opening(
    opening: &mut Option<BoxFuture<'static, Result<Socket, ConnectError>>>,
) -> Result<Socket, ConnectError> {
    match opening {
        Some(future) => future.as_mut().await,
        None => pending().await,
    }
}

async fn recv_socket(socket: &mut Option<Socket>) -> Option<SocketEvent> {
    match socket {
        Some(socket) => socket.inbound.recv().await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending::<()>().await,
    }
}
