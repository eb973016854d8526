//! One physical duplex socket to one endpoint
//!
//! A [`Connection`] owns the framed transport and a background I/O task.
//! Everything observable about the socket (open, inbound frames, close,
//! errors) is delivered as [`ConnectionEvent`]s; the session channel driver
//! reacts to those. The connection itself never buffers outbound messages
//! while closed and never reconnects; both are the driver's job.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use url::Url;

use tether_protocol::{Body, CodecError, ControlSignal, Envelope, EnvelopeCodec, PROTOCOL_VERSION};
use tether_utils::{Result, TetherError};

use crate::config::KeepaliveConfig;

/// Trait alias for streams that can be used with Framed
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote side ended the connection. `reconnect: false` means the
    /// server sent an explicit shutdown control frame first; the channel
    /// must not dial again on its own.
    Remote { reconnect: bool },
    /// Transport failure
    Abrupt,
    /// No inbound traffic within the idle window
    IdleTimeout,
    /// Local `close()` call
    Local,
}

impl CloseReason {
    /// Whether the session channel should enter its reconnect loop
    pub fn triggers_reconnect(&self) -> bool {
        match self {
            CloseReason::Remote { reconnect } => *reconnect,
            CloseReason::Abrupt | CloseReason::IdleTimeout => true,
            CloseReason::Local => false,
        }
    }
}

/// Events surfaced by the connection's I/O task
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Dial and handshake completed; the socket is writable
    Opened,
    /// One inbound frame (keep-alive and shutdown control traffic is
    /// consumed internally and never appears here)
    Frame(Envelope),
    /// The connection ended; no further events follow
    Closed(CloseReason),
    /// Dial/handshake failure, or a non-fatal inbound decode error while
    /// open (the connection stays up for the latter)
    Error(TetherError),
}

/// Client connection to the session backend
pub struct Connection {
    outgoing: mpsc::Sender<Envelope>,
    opened: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Connection {
    /// Start dialing `endpoint` (`tcp://host:port` or `unix://path`).
    ///
    /// Returns immediately; completion is signaled by
    /// [`ConnectionEvent::Opened`] or [`ConnectionEvent::Error`] on the
    /// returned receiver. On success the I/O task first transmits a hello
    /// control frame carrying the bearer `token`.
    pub fn open(
        endpoint: &str,
        token: String,
        keepalive: KeepaliveConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let opened = Arc::new(AtomicBool::new(false));

        tokio::spawn(io_task(
            endpoint.to_string(),
            token,
            keepalive,
            Arc::clone(&opened),
            outgoing_rx,
            event_tx,
            shutdown_rx,
        ));

        (
            Self {
                outgoing: outgoing_tx,
                opened,
                shutdown: Some(shutdown_tx),
            },
            event_rx,
        )
    }

    /// Whether `Opened` has been emitted
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Queue one frame for transmission.
    ///
    /// Fails synchronously with `NotConnected` before the handshake has
    /// completed; the connection does not buffer pre-open sends.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_open() {
            return Err(TetherError::NotConnected);
        }

        self.outgoing.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TetherError::connection("outgoing queue full")
            }
            mpsc::error::TrySendError::Closed(_) => TetherError::ConnectionClosed,
        })
    }

    /// Close the connection. Idempotent: exactly one
    /// `Closed(CloseReason::Local)` is emitted no matter how many times
    /// this is called, and calls after the connection died are no-ops.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Dial the endpoint URL, yielding a boxed duplex stream
async fn dial(endpoint: &str) -> Result<Box<dyn StreamTrait>> {
    if endpoint.starts_with("tcp://") {
        let parsed = Url::parse(endpoint)
            .map_err(|e| TetherError::connection(format!("Invalid TCP URL '{}': {}", endpoint, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TetherError::connection("Missing host in TCP URL"))?;
        let port = parsed
            .port()
            .ok_or_else(|| TetherError::connection("Missing port in TCP URL"))?;

        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TetherError::connection(format!("Failed to connect to {}: {}", addr, e)))?;
        Ok(Box::new(stream))
    } else {
        // Assume Unix socket (either unix:// prefix or raw path)
        let path_str = if endpoint.starts_with("unix://") {
            let parsed = Url::parse(endpoint)
                .map_err(|e| TetherError::connection(format!("Invalid Unix URL: {}", e)))?;
            parsed.path().to_string()
        } else {
            endpoint.to_string()
        };

        let path = PathBuf::from(path_str);
        let stream = UnixStream::connect(&path).await.map_err(|e| {
            TetherError::connection(format!("Failed to connect to {}: {}", path.display(), e))
        })?;
        Ok(Box::new(stream))
    }
}

/// Background task that owns the socket
async fn io_task(
    endpoint: String,
    token: String,
    keepalive: KeepaliveConfig,
    opened: Arc<AtomicBool>,
    mut outgoing: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<ConnectionEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let stream = match dial(&endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Dial failed for {}: {}", endpoint, e);
            let _ = events.send(ConnectionEvent::Error(e)).await;
            return;
        }
    };

    let mut framed = Framed::new(stream, EnvelopeCodec::new());

    let hello = Envelope::control(ControlSignal::Hello {
        token,
        protocol_version: PROTOCOL_VERSION,
    });
    if let Err(e) = framed.send(hello).await {
        let _ = events
            .send(ConnectionEvent::Error(TetherError::connection(format!(
                "Handshake failed: {}",
                e
            ))))
            .await;
        return;
    }

    opened.store(true, Ordering::Release);
    if events.send(ConnectionEvent::Opened).await.is_err() {
        return;
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + keepalive.interval,
        keepalive.interval,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_traffic = tokio::time::Instant::now();

    loop {
        let idle_deadline = last_traffic + keepalive.idle_timeout;

        tokio::select! {
            _ = &mut shutdown => {
                let _ = framed.close().await;
                let _ = events.send(ConnectionEvent::Closed(CloseReason::Local)).await;
                return;
            }

            maybe = outgoing.recv() => match maybe {
                Some(envelope) => {
                    if let Err(e) = framed.send(envelope).await {
                        tracing::error!("Failed to send frame: {}", e);
                        let _ = events.send(ConnectionEvent::Closed(CloseReason::Abrupt)).await;
                        return;
                    }
                }
                None => {
                    // Connection handle dropped
                    let _ = framed.close().await;
                    let _ = events.send(ConnectionEvent::Closed(CloseReason::Local)).await;
                    return;
                }
            },

            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::warn!("No traffic for {:?}, closing", keepalive.idle_timeout);
                let _ = events.send(ConnectionEvent::Closed(CloseReason::IdleTimeout)).await;
                return;
            }

            _ = ping.tick() => {
                if let Err(e) = framed.send(Envelope::control(ControlSignal::Ping)).await {
                    tracing::error!("Failed to send keep-alive: {}", e);
                    let _ = events.send(ConnectionEvent::Closed(CloseReason::Abrupt)).await;
                    return;
                }
            }

            result = framed.next() => match result {
                Some(Ok(envelope)) => {
                    last_traffic = tokio::time::Instant::now();
                    tracing::debug!(kind = envelope.body.kind(), id = %envelope.id, "Received frame");

                    match &envelope.body {
                        Body::SystemControl { signal: ControlSignal::Ping } => {
                            if framed.send(Envelope::control(ControlSignal::Pong)).await.is_err() {
                                let _ = events.send(ConnectionEvent::Closed(CloseReason::Abrupt)).await;
                                return;
                            }
                        }
                        Body::SystemControl { signal: ControlSignal::Pong } => {}
                        Body::SystemControl { signal: ControlSignal::Shutdown } => {
                            tracing::info!("Server requested shutdown");
                            let _ = events
                                .send(ConnectionEvent::Closed(CloseReason::Remote { reconnect: false }))
                                .await;
                            return;
                        }
                        _ => {
                            if events.send(ConnectionEvent::Frame(envelope)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Some(Err(CodecError::Malformed(msg))) => {
                    // Bad frame dropped, the connection stays up
                    tracing::warn!("Dropping malformed inbound frame: {}", msg);
                    let _ = events
                        .send(ConnectionEvent::Error(TetherError::Malformed(msg)))
                        .await;
                }
                Some(Err(e)) => {
                    tracing::error!("Transport error: {}", e);
                    let _ = events.send(ConnectionEvent::Closed(CloseReason::Abrupt)).await;
                    return;
                }
                None => {
                    tracing::info!("Server closed connection");
                    let _ = events
                        .send(ConnectionEvent::Closed(CloseReason::Remote { reconnect: true }))
                        .await;
                    return;
                }
            }
        }
    }
}
