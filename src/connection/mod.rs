//! The per-connection engine: one protocol engine, one transport, and the
//! pair of background tasks that drive them.

pub(crate) mod tasks;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::debug;
use tokio::io::{split, WriteHalf};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::close::{close_code, CloseReason};
use crate::error::WebSocketError;
use crate::message::Message;
use crate::protocol::frame::FrameError;
use crate::protocol::{ProtocolEngine, Role};
use crate::stream::Stream;

/// Bytes requested from the transport per read.
pub(crate) const RECEIVE_BYTES: usize = 4096;

/// How long a local `close()` waits for the peer's TCP shutdown before
/// forcibly closing the transport.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A control frame carries at most 125 payload bytes, two of which a close
/// frame spends on the status code.
const MAX_CONTROL_PAYLOAD: usize = 125;
const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// A writer work item; `done` resolves once every byte the engine had
/// pending when the item was serviced has been handed to the transport.
pub(crate) struct Flush {
    pub(crate) done: Option<oneshot::Sender<()>>,
}

/// State shared between the connection handle and its two tasks.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) role: Role,
    pub(crate) protocol: Mutex<ProtocolEngine>,
    pub(crate) close_reason: OnceLock<CloseReason>,
    pub(crate) flush_tx: flume::Sender<Flush>,
    pub(crate) pong_tx: watch::Sender<u64>,
    pub(crate) closed: CancellationToken,
    pub(crate) reader_running: AtomicBool,
    pub(crate) writer_running: AtomicBool,
    pub(crate) write_half: Mutex<WriteHalf<Stream>>,
}

impl Shared {
    /// Records the close reason; the first assignment wins and every later
    /// operation observes it.
    pub(crate) fn set_close_reason(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
    }

    /// Wakes the writer without waiting for the flush to complete.
    pub(crate) fn wake_writer(&self) {
        let _ = self.flush_tx.send(Flush { done: None });
    }
}

/// A WebSocket connection.
///
/// Cloning the handle is cheap; all clones drive the same connection, and
/// each complete inbound message is delivered to exactly one
/// [`get_message()`](Self::get_message) caller, in network order.
#[derive(Clone)]
pub struct WebSocketConnection {
    shared: Arc<Shared>,
    message_rx: flume::Receiver<Result<Message, CloseReason>>,
}

impl WebSocketConnection {
    /// Builds a connection over a freshly handshaken (or handshaking)
    /// protocol engine, returning the reader and writer tasks for the
    /// caller to spawn.
    pub(crate) fn new(
        stream: Stream,
        protocol: ProtocolEngine,
    ) -> (Self, tasks::Reader, tasks::Writer) {
        let role = protocol.role();
        let (read_half, write_half) = split(stream);
        let (flush_tx, flush_rx) = flume::unbounded();
        // zero capacity: a slow consumer applies backpressure to the reader
        let (message_tx, message_rx) = flume::bounded(0);
        let (pong_tx, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            protocol: Mutex::new(protocol),
            close_reason: OnceLock::new(),
            flush_tx,
            pong_tx,
            closed: CancellationToken::new(),
            reader_running: AtomicBool::new(true),
            writer_running: AtomicBool::new(true),
            write_half: Mutex::new(write_half),
        });

        // The client is responsible for initiating the connection, so it
        // has data ready to send immediately.
        if role == Role::Client {
            shared.wake_writer();
        }

        let connection = Self {
            shared: Arc::clone(&shared),
            message_rx,
        };
        let reader = tasks::Reader::new(Arc::clone(&shared), read_half, message_tx);
        let writer = tasks::Writer::new(shared, flush_rx);
        (connection, reader, writer)
    }

    /// A process-unique identifier for this connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Is this a client instance?
    pub fn is_client(&self) -> bool {
        self.shared.role == Role::Client
    }

    /// Is this a server instance?
    pub fn is_server(&self) -> bool {
        self.shared.role == Role::Server
    }

    /// If the connection is open and usable, this is None. Once the
    /// connection is closing or closed, it carries the [`CloseReason`] and
    /// no further operations are permitted.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.shared.close_reason.get()
    }

    /// Sends a WebSocket message.
    ///
    /// On successful return, every byte the protocol engine produced for
    /// this message has been handed to the transport.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::ConnectionClosed`] if the connection is closed.
    pub async fn send_message(&self, message: impl Into<Message>) -> Result<(), WebSocketError> {
        self.guard()?;
        {
            let mut protocol = self.shared.protocol.lock().await;
            protocol.send_data(message.into()).map_err(map_frame_error)?;
        }
        self.flush().await
    }

    /// Returns the next WebSocket message.
    ///
    /// Suspends until a message is available.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::ConnectionClosed`] if the connection is already
    /// closed, or closes while waiting for a message.
    pub async fn get_message(&self) -> Result<Message, WebSocketError> {
        self.guard()?;
        match self.message_rx.recv_async().await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(reason)) => Err(WebSocketError::ConnectionClosed(reason)),
            // the reader task is gone, taking its sender with it
            Err(_) => Err(self.connection_closed()),
        }
    }

    /// Sends a WebSocket ping and waits for any pong.
    ///
    /// Pongs are not matched to pings by payload: if two pings are in
    /// flight, the first pong resolves both.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::ConnectionClosed`] if the connection is closed;
    /// [`WebSocketError::ControlFrameTooLargeError`] if the payload exceeds
    /// 125 bytes.
    pub async fn ping(&self, payload: impl Into<Vec<u8>>) -> Result<(), WebSocketError> {
        self.guard()?;
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLargeError);
        }
        // subscribe before flushing so a fast pong cannot slip past
        let mut pong_rx = self.shared.pong_tx.subscribe();
        {
            let mut protocol = self.shared.protocol.lock().await;
            protocol.ping(payload).map_err(map_frame_error)?;
        }
        self.flush().await?;
        tokio::select! {
            changed = pong_rx.changed() => changed.map_err(|_| self.connection_closed()),
            _ = self.shared.closed.cancelled() => Err(self.connection_closed()),
        }
    }

    /// Closes the WebSocket connection.
    ///
    /// Sends a closing frame and suspends until the transport is shut
    /// down. After this returns, any further operation on the connection
    /// fails with [`WebSocketError::ConnectionClosed`].
    ///
    /// # Errors
    ///
    /// [`WebSocketError::ConnectionClosed`] if the connection is already
    /// closed; [`WebSocketError::ControlFrameTooLargeError`] if the reason
    /// exceeds 123 bytes.
    pub async fn close(&self, code: u16, reason: Option<String>) -> Result<(), WebSocketError> {
        if let Some(reason) = &reason {
            if reason.len() > MAX_CLOSE_REASON {
                return Err(WebSocketError::ControlFrameTooLargeError);
            }
        }
        let close_reason = CloseReason::new(code, reason.clone());
        if self.shared.close_reason.set(close_reason).is_err() {
            return Err(self.connection_closed());
        }
        {
            let mut protocol = self.shared.protocol.lock().await;
            protocol.close(code, reason.as_deref()).map_err(map_frame_error)?;
        }
        self.shared.wake_writer();

        let closed = self.shared.closed.clone();
        if tokio::time::timeout(CLOSE_TIMEOUT, closed.cancelled())
            .await
            .is_err()
        {
            debug!(
                "conn#{} timed out waiting for shutdown, closing transport",
                self.shared.id
            );
            tasks::teardown(&self.shared).await;
        }
        Ok(())
    }

    /// Forcibly closes the transport, used when the connection's scope is
    /// torn down by a failing task.
    pub(crate) async fn shutdown_transport(&self) {
        tasks::teardown(&self.shared).await;
    }

    fn guard(&self) -> Result<(), WebSocketError> {
        match self.shared.close_reason.get() {
            Some(reason) => Err(WebSocketError::ConnectionClosed(reason.clone())),
            None => Ok(()),
        }
    }

    /// The error for operations interrupted by teardown; falls back to an
    /// abnormal-closure reason if none was recorded.
    fn connection_closed(&self) -> WebSocketError {
        let reason = self.shared.close_reason.get().cloned().unwrap_or_else(|| {
            CloseReason::new(
                close_code::ABNORMAL_CLOSURE,
                Some("TCP connection aborted".to_owned()),
            )
        });
        WebSocketError::ConnectionClosed(reason)
    }

    /// Submits a flush work item and waits until the writer has drained
    /// the engine and handed the bytes to the transport.
    async fn flush(&self) -> Result<(), WebSocketError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .flush_tx
            .send(Flush { done: Some(done_tx) })
            .map_err(|_| self.connection_closed())?;
        done_rx.await.map_err(|_| self.connection_closed())
    }
}

fn map_frame_error(err: FrameError) -> WebSocketError {
    match err {
        FrameError::ControlFrameTooLarge => WebSocketError::ControlFrameTooLargeError,
        _ => WebSocketError::PayloadTooLargeError,
    }
}
