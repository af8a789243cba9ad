use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{Flush, Shared, RECEIVE_BYTES};
use crate::close::{close_code, CloseReason};
use crate::message::Message;
use crate::protocol::Event;
use crate::protocol::Role;
use crate::stream::Stream;

fn aborted_reason() -> CloseReason {
    CloseReason::new(
        close_code::ABNORMAL_CLOSURE,
        Some("TCP connection aborted".to_owned()),
    )
}

/// A background task that reads network data and dispatches the protocol
/// events it produces.
pub(crate) struct Reader {
    shared: Arc<Shared>,
    read_half: ReadHalf<Stream>,
    message_tx: flume::Sender<Result<Message, CloseReason>>,
    bytes_message: Vec<u8>,
    str_message: String,
}

impl Reader {
    pub(crate) fn new(
        shared: Arc<Shared>,
        read_half: ReadHalf<Stream>,
        message_tx: flume::Sender<Result<Message, CloseReason>>,
    ) -> Self {
        Self {
            shared,
            read_half,
            message_tx,
            bytes_message: Vec::new(),
            str_message: String::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut buf = [0u8; RECEIVE_BYTES];
        while self.shared.reader_running.load(Ordering::Acquire) {
            let n = match self.read_half.read(&mut buf).await {
                Ok(n) => n,
                // the transport was closed under us during teardown
                Err(_) if !self.shared.reader_running.load(Ordering::Acquire) => break,
                Err(err) => {
                    debug!("conn#{} transport read failed: {}", self.shared.id, err);
                    0
                }
            };
            if n == 0 {
                debug!(
                    "conn#{} received zero bytes (connection closed)",
                    self.shared.id
                );
                // If TCP closed before the WebSocket did, record it as an
                // abnormal closure.
                let ws_closed = self.shared.protocol.lock().await.is_closed();
                if !ws_closed {
                    self.shared.set_close_reason(aborted_reason());
                    self.drain_message_queue().await;
                }
                teardown(&self.shared).await;
                break;
            }
            debug!("conn#{} received {} bytes", self.shared.id, n);
            self.shared.protocol.lock().await.receive_bytes(&buf[..n]);
            self.dispatch_events().await;
        }
        debug!("conn#{} reader task finished", self.shared.id);
    }

    /// Drains and dispatches engine events until none remain; handling an
    /// event (accepting a handshake, say) can itself produce more.
    async fn dispatch_events(&mut self) {
        loop {
            let events: Vec<Event> = self.shared.protocol.lock().await.events().collect();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.handle_event(event).await;
            }
        }
    }

    /// Processes one protocol event.
    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ConnectionRequested { resource } => {
                debug!(
                    "conn#{} accepting websocket for {}",
                    self.shared.id, resource
                );
                self.shared.protocol.lock().await.accept();
                self.shared.wake_writer();
            }
            Event::ConnectionEstablished => {
                debug!("conn#{} websocket established", self.shared.id);
                // flush anything queued while the handshake was in flight
                self.shared.wake_writer();
            }
            Event::ConnectionClosed { code, reason } => {
                self.shared.set_close_reason(CloseReason::new(code, reason));
                self.drain_message_queue().await;
                self.shared.writer_running.store(false, Ordering::Release);
                self.shared.wake_writer();
            }
            Event::BytesReceived {
                data,
                message_finished,
            } => {
                debug!("conn#{} received binary frame", self.shared.id);
                self.bytes_message.extend_from_slice(&data);
                if message_finished {
                    let message = Message::Binary(mem::take(&mut self.bytes_message));
                    self.publish(message).await;
                }
            }
            Event::TextReceived {
                data,
                message_finished,
            } => {
                debug!("conn#{} received text frame", self.shared.id);
                self.str_message.push_str(&data);
                if message_finished {
                    let message = Message::Text(mem::take(&mut self.str_message));
                    self.publish(message).await;
                }
            }
            Event::PingReceived { .. } => {
                debug!("conn#{} ping", self.shared.id);
                // the engine queued the pong automatically, we just need to
                // send it
                self.shared.wake_writer();
            }
            Event::PongReceived { payload } => {
                debug!("conn#{} pong {:?}", self.shared.id, payload);
                self.shared.pong_tx.send_modify(|pongs| *pongs += 1);
            }
        }
    }

    /// Hands a completed message to a `get_message` caller. The channel has
    /// no capacity, so this suspends until a consumer takes the message or
    /// the connection tears down.
    async fn publish(&self, message: Message) {
        tokio::select! {
            result = self.message_tx.send_async(Ok(message)) => {
                if result.is_err() {
                    debug!("conn#{} message dropped, no consumers left", self.shared.id);
                }
            }
            _ = self.shared.closed.cancelled() => {}
        }
    }

    /// If any tasks are suspended on `get_message`, wakes them up with the
    /// close sentinel. A non-blocking put only succeeds while a consumer is
    /// waiting, so no sentinel is buffered for future callers.
    async fn drain_message_queue(&self) {
        let Some(reason) = self.shared.close_reason.get().cloned() else {
            return;
        };
        debug!("conn#{} websocket closed {}", self.shared.id, reason);
        while self.message_tx.try_send(Err(reason.clone())).is_ok() {
            tokio::task::yield_now().await;
        }
    }
}

/// A background task that writes data to the network.
///
/// The writer is the only place that hands bytes to the transport, so after
/// its loop exits all pending WebSocket data has been sent and the stream
/// can be torn down.
pub(crate) struct Writer {
    shared: Arc<Shared>,
    flush_rx: flume::Receiver<Flush>,
}

impl Writer {
    pub(crate) fn new(shared: Arc<Shared>, flush_rx: flume::Receiver<Flush>) -> Self {
        Self { shared, flush_rx }
    }

    pub(crate) async fn run(self) {
        while self.shared.writer_running.load(Ordering::Acquire) {
            let Ok(flush) = self.flush_rx.recv_async().await else {
                break;
            };
            let data = self.shared.protocol.lock().await.bytes_to_send();
            if !data.is_empty() {
                debug!("conn#{} sending {} bytes", self.shared.id, data.len());
                let mut write_half = self.shared.write_half.lock().await;
                let sent = send_all(&mut write_half, &data).await;
                drop(write_half);
                if let Err(err) = sent {
                    debug!("conn#{} transport write failed: {}", self.shared.id, err);
                    self.shared.set_close_reason(aborted_reason());
                    // dropping the unacked flush surfaces the closure to
                    // the caller
                    teardown(&self.shared).await;
                    break;
                }
            }
            if let Some(done) = flush.done {
                let _ = done.send(());
            }
        }

        // The server is responsible for initiating TCP shutdown; the client
        // waits for the server's FIN via the reader's zero-byte path.
        if self.shared.role == Role::Server {
            teardown(&self.shared).await;
        }
        debug!("conn#{} writer task finished", self.shared.id);
    }
}

async fn send_all(write_half: &mut WriteHalf<Stream>, data: &[u8]) -> std::io::Result<()> {
    write_half.write_all(data).await?;
    write_half.flush().await
}

/// Closes the transport: stop both tasks, unblock the writer, shut the
/// stream down, and resolve the closed signal. Safe to invoke from any task
/// and more than once.
pub(crate) async fn teardown(shared: &Shared) {
    shared.reader_running.store(false, Ordering::Release);
    shared.writer_running.store(false, Ordering::Release);
    shared.wake_writer();
    {
        let mut write_half = shared.write_half.lock().await;
        if let Err(err) = write_half.shutdown().await {
            // the TCP connection is already dead
            debug!("conn#{} shutdown error: {}", shared.id, err);
        }
    }
    shared.closed.cancel();
}
