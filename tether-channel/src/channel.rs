//! Session channel orchestration
//!
//! A [`SessionChannel`] is the consumer-facing handle; all state lives in a
//! single driver task that serializes the two concurrent sources touching
//! it: consumer calls (`connect`/`send`/`abort_active`/`disconnect`) and the
//! connection's asynchronous events. Commands and connection events both
//! funnel into the driver's select loop, so no mutation ever races another.
//!
//! Connection events are tagged with a generation counter; events from a
//! connection that has already been replaced are discarded, which is what
//! keeps a stale stream from a dead socket from ever resurrecting.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tether_protocol::{Body, ControlSignal, DeliveryStatus, Envelope};

use crate::auth::TokenProvider;
use crate::config::ChannelConfig;
use crate::connection::{CloseReason, Connection, ConnectionEvent};
use crate::observer::{ChannelError, ChannelObserver};

/// How often the driver checks `Sending` messages against their
/// delivery-confirmation deadline
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Connection lifecycle of a session channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(u32),
    /// Auto-retry exhausted (or credentials rejected); only an explicit
    /// `connect()` leaves this state
    Failed,
}

/// Consumer requests, serialized into the driver task
enum Command {
    Connect,
    Disconnect,
    Send { id: String, content: String },
    Retry { old_id: String, new_id: String },
    AbortActive,
    Shutdown,
}

/// A user-originated message awaiting confirmation
struct PendingMessage {
    content: String,
    status: DeliveryStatus,
    deadline: Option<tokio::time::Instant>,
}

/// In-progress accumulation of a chunked remote response
#[derive(Default)]
struct StreamingAssembly {
    accumulated: String,
}

/// Handle to one streaming session channel.
///
/// Cheap to construct per logical channel (chat and terminal are two
/// independent instances); owns its driver task and its connection
/// exclusively. All methods are non-blocking: completion and delivery are
/// reported asynchronously through the [`ChannelObserver`].
pub struct SessionChannel {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl SessionChannel {
    /// Spawn the driver task for a new channel.
    ///
    /// The channel starts disconnected; call [`connect`](Self::connect) to
    /// dial.
    pub fn spawn(
        config: ChannelConfig,
        auth: Arc<dyn TokenProvider>,
        observer: Box<dyn ChannelObserver>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = Driver::new(config, auth, observer, command_rx);
        let task = tokio::spawn(driver.run());

        Self {
            commands: command_tx,
            task,
        }
    }

    /// Begin connecting. No-op while already connecting or connected;
    /// from `Failed` this restarts the attempt counter.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Tear the connection down and stay down until the next `connect()`
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Submit user text for transmission.
    ///
    /// Returns the freshly minted message id immediately so later observer
    /// events can be correlated; transmission itself is asynchronous. While
    /// disconnected the message is queued for replay in call order (unless
    /// buffering is disabled in the config).
    pub fn send(&self, content: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let _ = self.commands.send(Command::Send {
            id: id.clone(),
            content: content.into(),
        });
        id
    }

    /// Re-send the content of a failed message under a fresh id.
    ///
    /// The failed entry keeps its `Failed` status; the returned id starts a
    /// new delivery lifecycle for the same content.
    pub fn retry(&self, failed_id: &str) -> String {
        let new_id = Uuid::new_v4().to_string();
        let _ = self.commands.send(Command::Retry {
            old_id: failed_id.to_string(),
            new_id: new_id.clone(),
        });
        new_id
    }

    /// Ask the remote to stop producing the in-flight response.
    ///
    /// Best-effort towards the remote, deterministic locally: open stream
    /// assemblies are discarded and the active message is marked failed
    /// whether or not the remote ever acknowledges.
    pub fn abort_active(&self) {
        let _ = self.commands.send(Command::AbortActive);
    }

    /// Stop the driver task and release the connection
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

/// Everything the driver reacts to, collapsed out of the select loop so
/// handlers run with no outstanding borrows
enum Tick {
    Command(Option<Command>),
    Event(u64, ConnectionEvent),
    ReconnectTimer,
    Sweep,
}

struct Driver {
    config: ChannelConfig,
    auth: Arc<dyn TokenProvider>,
    observer: Box<dyn ChannelObserver>,
    commands: mpsc::UnboundedReceiver<Command>,

    /// Connection events, tagged with the generation that produced them
    events_tx: mpsc::Sender<(u64, ConnectionEvent)>,
    events_rx: mpsc::Receiver<(u64, ConnectionEvent)>,

    state: ConnectionState,
    conn: Option<Connection>,
    conn_gen: u64,
    session_id: Option<String>,

    pending: HashMap<String, PendingMessage>,
    /// Ids waiting to be transmitted, in `send()` call order
    queue: VecDeque<String>,
    /// Ids transmitted but unconfirmed, in transmission order
    sent_order: VecDeque<String>,
    assemblies: HashMap<String, StreamingAssembly>,

    reconnect_at: Option<tokio::time::Instant>,
    attempt: u32,
}

impl Driver {
    fn new(
        config: ChannelConfig,
        auth: Arc<dyn TokenProvider>,
        observer: Box<dyn ChannelObserver>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            config,
            auth,
            observer,
            commands,
            events_tx,
            events_rx,
            state: ConnectionState::Disconnected,
            conn: None,
            conn_gen: 0,
            session_id: None,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            sent_order: VecDeque::new(),
            assemblies: HashMap::new(),
            reconnect_at: None,
            attempt: 0,
        }
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let reconnect_deadline = self
                .reconnect_at
                .unwrap_or_else(tokio::time::Instant::now);

            let tick = tokio::select! {
                maybe = self.commands.recv() => Tick::Command(maybe),
                Some((gen, event)) = self.events_rx.recv() => Tick::Event(gen, event),
                _ = tokio::time::sleep_until(reconnect_deadline),
                    if self.reconnect_at.is_some() => Tick::ReconnectTimer,
                _ = sweep.tick() => Tick::Sweep,
            };

            match tick {
                Tick::Command(None) | Tick::Command(Some(Command::Shutdown)) => {
                    self.drop_connection();
                    return;
                }
                Tick::Command(Some(command)) => self.handle_command(command),
                Tick::Event(gen, event) => {
                    if gen == self.conn_gen {
                        self.handle_event(event);
                    } else {
                        tracing::debug!(gen, "Dropping event from replaced connection");
                    }
                }
                Tick::ReconnectTimer => {
                    self.reconnect_at = None;
                    self.begin_attempt();
                }
                Tick::Sweep => self.sweep_deadlines(),
            }
        }
    }

    // ==================== Consumer commands ====================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.handle_connect(),
            Command::Disconnect => self.handle_disconnect(),
            Command::Send { id, content } => self.handle_send(id, content),
            Command::Retry { old_id, new_id } => self.handle_retry(old_id, new_id),
            Command::AbortActive => self.handle_abort(),
            // Consumed by the run loop
            Command::Shutdown => {}
        }
    }

    fn handle_connect(&mut self) {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                tracing::debug!("connect() while already {:?}, ignoring", self.state);
            }
            _ => {
                self.attempt = 0;
                self.reconnect_at = None;
                self.begin_attempt();
            }
        }
    }

    fn handle_disconnect(&mut self) {
        self.reconnect_at = None;
        self.attempt = 0;
        self.fail_open_assemblies();
        self.drop_connection();
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_send(&mut self, id: String, content: String) {
        if !self.config.buffer_while_disconnected && self.state != ConnectionState::Connected {
            self.pending.insert(
                id.clone(),
                PendingMessage {
                    content,
                    status: DeliveryStatus::Failed,
                    deadline: None,
                },
            );
            self.observer.on_error(&ChannelError::NotConnected(id.clone()));
            self.observer.on_status_changed(&id, DeliveryStatus::Failed);
            return;
        }

        self.pending.insert(
            id.clone(),
            PendingMessage {
                content,
                status: DeliveryStatus::Queued,
                deadline: None,
            },
        );
        self.queue.push_back(id.clone());
        self.observer.on_status_changed(&id, DeliveryStatus::Queued);

        if self.state == ConnectionState::Connected {
            self.flush_queue();
        }
    }

    fn handle_retry(&mut self, old_id: String, new_id: String) {
        match self.pending.get(&old_id) {
            Some(entry) if entry.status == DeliveryStatus::Failed => {
                let content = entry.content.clone();
                tracing::debug!(old = %old_id, new = %new_id, "Retrying failed message");
                self.handle_send(new_id, content);
            }
            _ => {
                self.observer
                    .on_error(&ChannelError::UnknownCorrelation(old_id));
            }
        }
    }

    fn handle_abort(&mut self) {
        if self.state == ConnectionState::Connected {
            if let Some(conn) = &self.conn {
                let abort = Envelope::new(
                    Uuid::new_v4().to_string(),
                    self.session_id.clone(),
                    Body::SystemControl {
                        signal: ControlSignal::Abort,
                    },
                );
                if let Err(e) = conn.send(abort) {
                    tracing::warn!("Abort signal not transmitted: {}", e);
                }
            }
        }

        // Local finalization is unconditional: the remote may never ack
        let interrupted: Vec<String> = self.assemblies.drain().map(|(id, _)| id).collect();
        for id in interrupted {
            self.observer.on_error(&ChannelError::Aborted(id.clone()));
            self.observer.on_status_changed(&id, DeliveryStatus::Failed);
        }

        let cancelled = self
            .sent_order
            .iter()
            .rev()
            .find(|id| {
                self.pending
                    .get(*id)
                    .map(|p| p.status == DeliveryStatus::Sending)
                    .unwrap_or(false)
            })
            .cloned();
        if let Some(id) = cancelled {
            if let Some(entry) = self.pending.get_mut(&id) {
                entry.status = DeliveryStatus::Failed;
                entry.deadline = None;
            }
            self.observer.on_error(&ChannelError::Aborted(id.clone()));
            self.observer.on_status_changed(&id, DeliveryStatus::Failed);
        }
    }

    // ==================== Connection lifecycle ====================

    fn begin_attempt(&mut self) {
        self.set_state(ConnectionState::Connecting);

        let token = match self.auth.token() {
            Ok(token) => token,
            Err(e) => {
                // Retrying with a credential we cannot obtain is pointless
                tracing::error!("Credential provider failed: {}", e);
                self.observer
                    .on_error(&ChannelError::AuthFailed(e.to_string()));
                self.drop_connection();
                self.reconnect_at = None;
                self.set_state(ConnectionState::Failed);
                return;
            }
        };

        self.conn_gen += 1;
        let gen = self.conn_gen;
        let (conn, mut conn_events) =
            Connection::open(&self.config.endpoint, token, self.config.keepalive);
        self.conn = Some(conn);

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = conn_events.recv().await {
                if events_tx.send((gen, event)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            // Anything still in flight from it is stale
            self.conn_gen += 1;
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                self.attempt = 0;
                self.set_state(ConnectionState::Connected);
                self.flush_queue();
            }
            ConnectionEvent::Frame(envelope) => self.handle_frame(envelope),
            ConnectionEvent::Closed(reason) => self.handle_closed(reason),
            ConnectionEvent::Error(e) => self.handle_conn_error(e),
        }
    }

    fn handle_closed(&mut self, reason: CloseReason) {
        tracing::info!(?reason, "Connection closed");
        self.conn = None;
        self.fail_open_assemblies();

        if reason.triggers_reconnect() {
            self.schedule_reconnect();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn handle_conn_error(&mut self, error: tether_utils::TetherError) {
        match self.state {
            ConnectionState::Connecting => {
                // Dial or handshake failed; this attempt is spent
                tracing::debug!("Connect attempt failed: {}", error);
                self.conn = None;
                self.schedule_reconnect();
            }
            ConnectionState::Connected => {
                // Inbound decode trouble; the connection itself is still up
                self.observer
                    .on_error(&ChannelError::Decode(error.to_string()));
            }
            _ => {
                tracing::debug!("Ignoring connection error while {:?}: {}", self.state, error);
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.attempt += 1;
        if self.config.reconnect.should_give_up(self.attempt) {
            tracing::error!(
                "Giving up after {} reconnect attempts",
                self.attempt - 1
            );
            self.reconnect_at = None;
            self.set_state(ConnectionState::Failed);
            return;
        }

        let delay = self.config.reconnect.next_delay(self.attempt);
        self.reconnect_at = Some(tokio::time::Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting(self.attempt));
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, self.attempt);
    }

    // ==================== Inbound frames ====================

    fn handle_frame(&mut self, envelope: Envelope) {
        let Envelope {
            id,
            session_id,
            body,
            ..
        } = envelope;

        match body {
            Body::StreamStart => {
                if self.assemblies.contains_key(&id) {
                    self.observer
                        .on_error(&ChannelError::DuplicateStreamStart(id));
                    return;
                }
                self.confirm_oldest_sending(session_id.as_deref());
                self.assemblies.insert(id.clone(), StreamingAssembly::default());
                self.observer.on_stream_started(&id);
            }
            Body::StreamChunk { delta } => match self.assemblies.get_mut(&id) {
                Some(assembly) => {
                    assembly.accumulated.push_str(&delta);
                    self.observer.on_stream_delta(&id, &delta);
                }
                None => {
                    self.observer
                        .on_error(&ChannelError::UnknownCorrelation(id));
                }
            },
            Body::StreamEnd => match self.assemblies.remove(&id) {
                Some(assembly) => {
                    self.observer.on_stream_complete(&id, &assembly.accumulated);
                }
                None => {
                    self.observer
                        .on_error(&ChannelError::UnknownCorrelation(id));
                }
            },
            Body::FullMessage { content } => {
                self.confirm_oldest_sending(session_id.as_deref());
                self.observer.on_message_delivered(&id, &content);
            }
            Body::StatusUpdate { status } => match self.pending.get_mut(&id) {
                Some(entry) => {
                    entry.status = status;
                    if status.is_terminal() {
                        entry.deadline = None;
                    }
                    self.observer.on_status_changed(&id, status);
                }
                None => {
                    self.observer
                        .on_error(&ChannelError::UnknownCorrelation(id));
                }
            },
            Body::ErrorNotice { message, fatal } => {
                self.observer.on_error(&ChannelError::Remote {
                    message,
                    fatal,
                });
                if fatal {
                    tracing::warn!("Remote reported a fatal error, recycling connection");
                    self.fail_open_assemblies();
                    self.drop_connection();
                    self.schedule_reconnect();
                }
            }
            Body::SystemControl { signal } => {
                // Keep-alive and shutdown never reach here; anything else
                // (including unknown forward-compat kinds) is ignorable
                tracing::debug!(?signal, "Ignoring control frame");
            }
            Body::UserCommand { .. } => {
                tracing::debug!(id = %id, "Ignoring inbound user_command frame");
            }
        }
    }

    /// First response frame after a transmission confirms the oldest
    /// unconfirmed message; the session binds at the same moment if it
    /// was not bound yet.
    fn confirm_oldest_sending(&mut self, session_id: Option<&str>) {
        if self.session_id.is_none() {
            if let Some(sid) = session_id {
                tracing::info!(session = sid, "Session bound");
                self.session_id = Some(sid.to_string());
            }
        }

        while let Some(id) = self.sent_order.pop_front() {
            if let Some(entry) = self.pending.get_mut(&id) {
                if entry.status == DeliveryStatus::Sending {
                    entry.status = DeliveryStatus::Delivered;
                    entry.deadline = None;
                    self.observer
                        .on_status_changed(&id, DeliveryStatus::Delivered);
                    return;
                }
            }
            // Entry already terminal (timed out, cancelled); keep popping
        }
    }

    // ==================== Queue and deadlines ====================

    /// Transmit queued messages in `send()` call order
    fn flush_queue(&mut self) {
        while let Some(id) = self.queue.front().cloned() {
            let Some(entry) = self.pending.get(&id) else {
                self.queue.pop_front();
                continue;
            };
            let Some(conn) = self.conn.as_ref() else {
                break;
            };

            let envelope =
                Envelope::user_command(id.clone(), self.session_id.clone(), entry.content.clone());
            match conn.send(envelope) {
                Ok(()) => {
                    self.queue.pop_front();
                    self.sent_order.push_back(id.clone());
                    let deadline = tokio::time::Instant::now() + self.config.delivery_timeout;
                    if let Some(entry) = self.pending.get_mut(&id) {
                        entry.status = DeliveryStatus::Sending;
                        entry.deadline = Some(deadline);
                    }
                    self.observer.on_status_changed(&id, DeliveryStatus::Sending);
                }
                Err(e) => {
                    // Stays queued; the next Opened replays it
                    tracing::debug!(id = %id, "Transmit deferred: {}", e);
                    break;
                }
            }
        }
    }

    /// Mark `Sending` messages past their confirmation window as failed
    fn sweep_deadlines(&mut self) {
        let now = tokio::time::Instant::now();
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| {
                entry.status == DeliveryStatus::Sending
                    && entry.deadline.map(|d| d <= now).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in overdue {
            if let Some(entry) = self.pending.get_mut(&id) {
                entry.status = DeliveryStatus::Failed;
                entry.deadline = None;
            }
            self.observer
                .on_error(&ChannelError::DeliveryTimeout(id.clone()));
            self.observer.on_status_changed(&id, DeliveryStatus::Failed);
        }
    }

    /// A lost connection invalidates every open assembly: partial
    /// responses are reported failed, never presented as complete
    fn fail_open_assemblies(&mut self) {
        let interrupted: Vec<String> = self.assemblies.drain().map(|(id, _)| id).collect();
        for id in interrupted {
            tracing::warn!(id = %id, "Discarding incomplete stream");
            self.observer
                .on_error(&ChannelError::StreamInterrupted(id.clone()));
            self.observer.on_status_changed(&id, DeliveryStatus::Failed);
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Channel state changed");
            self.state = next;
            self.observer.on_state_changed(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        State(ConnectionState),
        Started(String),
        Delivered(String, String),
        Delta(String, String),
        Complete(String, String),
        Status(String, DeliveryStatus),
        Error(String),
    }

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Vec<Event>>>);

    impl Recording {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ChannelObserver for Recording {
        fn on_state_changed(&mut self, state: ConnectionState) {
            self.0.lock().unwrap().push(Event::State(state));
        }
        fn on_stream_started(&mut self, id: &str) {
            self.0.lock().unwrap().push(Event::Started(id.into()));
        }
        fn on_message_delivered(&mut self, id: &str, content: &str) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Delivered(id.into(), content.into()));
        }
        fn on_stream_delta(&mut self, id: &str, delta: &str) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Delta(id.into(), delta.into()));
        }
        fn on_stream_complete(&mut self, id: &str, text: &str) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Complete(id.into(), text.into()));
        }
        fn on_status_changed(&mut self, id: &str, status: DeliveryStatus) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Status(id.into(), status));
        }
        fn on_error(&mut self, error: &ChannelError) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Error(format!("{:?}", error)));
        }
    }

    fn test_driver(config: ChannelConfig, recording: &Recording) -> Driver {
        let (_tx, rx) = mpsc::unbounded_channel();
        Driver::new(
            config,
            Arc::new(StaticToken("tok".into())),
            Box::new(recording.clone()),
            rx,
        )
    }

    fn frame(id: &str, session: Option<&str>, body: Body) -> Envelope {
        Envelope::new(id, session.map(str::to_string), body)
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.handle_send("m-1".into(), "hello".into());

        assert_eq!(driver.queue.len(), 1);
        assert_eq!(
            driver.pending.get("m-1").unwrap().status,
            DeliveryStatus::Queued
        );
        assert_eq!(
            rec.events(),
            vec![Event::Status("m-1".into(), DeliveryStatus::Queued)]
        );
    }

    #[tokio::test]
    async fn test_no_buffer_mode_fails_immediately() {
        let rec = Recording::default();
        let config = ChannelConfig::new("tcp://h:1").buffering(false);
        let mut driver = test_driver(config, &rec);

        driver.handle_send("m-1".into(), "hello".into());

        assert!(driver.queue.is_empty());
        assert_eq!(
            driver.pending.get("m-1").unwrap().status,
            DeliveryStatus::Failed
        );
        assert!(rec
            .events()
            .contains(&Event::Status("m-1".into(), DeliveryStatus::Failed)));
    }

    #[tokio::test]
    async fn test_stream_assembly_happy_path() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.handle_frame(frame("42", None, Body::StreamStart));
        driver.handle_frame(frame(
            "42",
            None,
            Body::StreamChunk {
                delta: "Hel".into(),
            },
        ));
        driver.handle_frame(frame(
            "42",
            None,
            Body::StreamChunk { delta: "lo".into() },
        ));
        driver.handle_frame(frame("42", None, Body::StreamEnd));

        assert_eq!(
            rec.events(),
            vec![
                Event::Started("42".into()),
                Event::Delta("42".into(), "Hel".into()),
                Event::Delta("42".into(), "lo".into()),
                Event::Complete("42".into(), "Hello".into()),
            ]
        );
        assert!(driver.assemblies.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_stream_start_keeps_original() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.handle_frame(frame("42", None, Body::StreamStart));
        driver.handle_frame(frame(
            "42",
            None,
            Body::StreamChunk {
                delta: "keep".into(),
            },
        ));
        driver.handle_frame(frame("42", None, Body::StreamStart));
        driver.handle_frame(frame("42", None, Body::StreamEnd));

        let events = rec.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.contains("DuplicateStreamStart"))));
        // The original assembly survived the duplicate start
        assert!(events.contains(&Event::Complete("42".into(), "keep".into())));
    }

    #[tokio::test]
    async fn test_chunk_without_open_assembly_reported() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.handle_frame(frame(
            "99",
            None,
            Body::StreamChunk {
                delta: "lost".into(),
            },
        ));
        driver.handle_frame(frame("99", None, Body::StreamEnd));

        let errors: Vec<_> = rec
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Error(msg) if msg.contains("UnknownCorrelation")))
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_connection_loss_discards_assemblies() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.handle_frame(frame("7", None, Body::StreamStart));
        driver.handle_frame(frame(
            "7",
            None,
            Body::StreamChunk {
                delta: "Par".into(),
            },
        ));
        driver.handle_closed(CloseReason::Abrupt);

        let events = rec.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.contains("StreamInterrupted"))));
        assert!(events.contains(&Event::Status("7".into(), DeliveryStatus::Failed)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Complete(id, _) if id == "7")));

        // A later end frame for the same id has nothing to land on
        driver.handle_frame(frame("7", None, Body::StreamEnd));
        assert!(!rec
            .events()
            .iter()
            .any(|e| matches!(e, Event::Complete(id, _) if id == "7")));
    }

    #[tokio::test]
    async fn test_first_response_confirms_oldest_and_binds_session() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        for id in ["m-1", "m-2"] {
            driver.pending.insert(
                id.into(),
                PendingMessage {
                    content: "x".into(),
                    status: DeliveryStatus::Sending,
                    deadline: None,
                },
            );
            driver.sent_order.push_back(id.into());
        }

        driver.handle_frame(frame(
            "a-1",
            Some("s-1"),
            Body::FullMessage {
                content: "ack".into(),
            },
        ));

        assert_eq!(driver.session_id.as_deref(), Some("s-1"));
        assert_eq!(
            driver.pending.get("m-1").unwrap().status,
            DeliveryStatus::Delivered
        );
        // Only the oldest is confirmed per response
        assert_eq!(
            driver.pending.get("m-2").unwrap().status,
            DeliveryStatus::Sending
        );
        assert!(rec
            .events()
            .contains(&Event::Delivered("a-1".into(), "ack".into())));
    }

    #[tokio::test]
    async fn test_session_binding_is_sticky() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.session_id = Some("s-1".into());
        driver.handle_frame(frame(
            "a-1",
            Some("s-other"),
            Body::FullMessage { content: "x".into() },
        ));
        assert_eq!(driver.session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_status_update_routes_to_pending() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.pending.insert(
            "m-1".into(),
            PendingMessage {
                content: "x".into(),
                status: DeliveryStatus::Sending,
                deadline: Some(tokio::time::Instant::now() + Duration::from_secs(60)),
            },
        );

        driver.handle_frame(frame(
            "m-1",
            None,
            Body::StatusUpdate {
                status: DeliveryStatus::Delivered,
            },
        ));

        let entry = driver.pending.get("m-1").unwrap();
        assert_eq!(entry.status, DeliveryStatus::Delivered);
        assert!(entry.deadline.is_none());
        assert!(rec
            .events()
            .contains(&Event::Status("m-1".into(), DeliveryStatus::Delivered)));
    }

    #[tokio::test]
    async fn test_status_update_unknown_id_reported() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.handle_frame(frame(
            "ghost",
            None,
            Body::StatusUpdate {
                status: DeliveryStatus::Delivered,
            },
        ));

        assert!(rec
            .events()
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.contains("UnknownCorrelation"))));
    }

    #[tokio::test]
    async fn test_retry_failed_message_reuses_content() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.pending.insert(
            "m-1".into(),
            PendingMessage {
                content: "try again".into(),
                status: DeliveryStatus::Failed,
                deadline: None,
            },
        );

        driver.handle_retry("m-1".into(), "m-2".into());

        let fresh = driver.pending.get("m-2").unwrap();
        assert_eq!(fresh.content, "try again");
        assert_eq!(fresh.status, DeliveryStatus::Queued);
        // The failed original is untouched
        assert_eq!(
            driver.pending.get("m-1").unwrap().status,
            DeliveryStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_retry_of_non_failed_message_reported() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.pending.insert(
            "m-1".into(),
            PendingMessage {
                content: "x".into(),
                status: DeliveryStatus::Sending,
                deadline: None,
            },
        );

        driver.handle_retry("m-1".into(), "m-2".into());
        driver.handle_retry("ghost".into(), "m-3".into());

        assert!(driver.pending.get("m-2").is_none());
        assert!(driver.pending.get("m-3").is_none());
        let errors: Vec<_> = rec
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Error(_)))
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_fails_overdue_sending() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver.pending.insert(
            "late".into(),
            PendingMessage {
                content: "x".into(),
                status: DeliveryStatus::Sending,
                deadline: Some(tokio::time::Instant::now() - Duration::from_secs(1)),
            },
        );
        driver.pending.insert(
            "fresh".into(),
            PendingMessage {
                content: "y".into(),
                status: DeliveryStatus::Sending,
                deadline: Some(tokio::time::Instant::now() + Duration::from_secs(60)),
            },
        );

        driver.sweep_deadlines();

        assert_eq!(
            driver.pending.get("late").unwrap().status,
            DeliveryStatus::Failed
        );
        assert_eq!(
            driver.pending.get("fresh").unwrap().status,
            DeliveryStatus::Sending
        );
        assert!(rec
            .events()
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.contains("DeliveryTimeout"))));
    }

    #[tokio::test]
    async fn test_give_up_after_max_attempts() {
        let rec = Recording::default();
        let config = ChannelConfig::new("tcp://h:1").reconnect(crate::ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        });
        let mut driver = test_driver(config, &rec);

        for _ in 0..3 {
            driver.schedule_reconnect();
            assert!(driver.reconnect_at.is_some());
            driver.reconnect_at = None;
        }
        driver.schedule_reconnect();

        assert_eq!(driver.state, ConnectionState::Failed);
        assert!(driver.reconnect_at.is_none());
        assert!(rec.events().contains(&Event::State(ConnectionState::Failed)));
    }

    #[tokio::test]
    async fn test_fatal_error_notice_recycles_connection() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);
        driver.state = ConnectionState::Connected;

        driver.handle_frame(frame(
            "e-1",
            None,
            Body::ErrorNotice {
                message: "backend on fire".into(),
                fatal: true,
            },
        ));

        assert!(matches!(driver.state, ConnectionState::Reconnecting(1)));
    }

    #[tokio::test]
    async fn test_nonfatal_error_notice_keeps_connection() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);
        driver.state = ConnectionState::Connected;

        driver.handle_frame(frame(
            "e-1",
            None,
            Body::ErrorNotice {
                message: "rate limited".into(),
                fatal: false,
            },
        ));

        assert_eq!(driver.state, ConnectionState::Connected);
        assert!(rec
            .events()
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.contains("rate limited"))));
    }

    #[tokio::test]
    async fn test_abort_finalizes_locally_without_connection() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);

        driver
            .assemblies
            .insert("a-1".into(), StreamingAssembly::default());
        driver.pending.insert(
            "m-1".into(),
            PendingMessage {
                content: "x".into(),
                status: DeliveryStatus::Sending,
                deadline: None,
            },
        );
        driver.sent_order.push_back("m-1".into());

        driver.handle_abort();

        assert!(driver.assemblies.is_empty());
        assert_eq!(
            driver.pending.get("m-1").unwrap().status,
            DeliveryStatus::Failed
        );
        let events = rec.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Error(msg) if msg.contains("Aborted"))));
    }

    #[tokio::test]
    async fn test_graceful_close_goes_disconnected_not_reconnecting() {
        let rec = Recording::default();
        let mut driver = test_driver(ChannelConfig::new("tcp://h:1"), &rec);
        driver.state = ConnectionState::Connected;

        driver.handle_closed(CloseReason::Remote { reconnect: false });

        assert_eq!(driver.state, ConnectionState::Disconnected);
        assert!(driver.reconnect_at.is_none());
    }
}
