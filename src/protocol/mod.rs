//! Sans-I/O WebSocket protocol engine.
//!
//! The engine consumes raw bytes via [`ProtocolEngine::receive_bytes`],
//! yields protocol [`Event`]s, and queues outbound bytes that the owner
//! drains with [`ProtocolEngine::bytes_to_send`]. It performs no I/O and
//! holds no locks; the connection layer is responsible for serializing
//! access to it.

pub(crate) mod frame;
mod handshake;

use std::collections::VecDeque;
use std::mem;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::close::close_code;
use crate::message::Message;
use frame::{encode_frame, parse_frame, Frame, FrameError, OpCode};

/// Which end of the connection this engine speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// A protocol-level occurrence, produced in network order.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// Server only: a valid opening handshake arrived; call
    /// [`ProtocolEngine::accept`] to queue the response.
    ConnectionRequested { resource: String },
    /// Client only: the server accepted the opening handshake.
    ConnectionEstablished,
    /// The connection closed, whether by handshake or protocol failure.
    ConnectionClosed { code: u16, reason: Option<String> },
    /// A binary frame arrived.
    BytesReceived { data: Vec<u8>, message_finished: bool },
    /// A text frame arrived, already UTF-8 validated.
    TextReceived { data: String, message_finished: bool },
    /// A ping arrived; the matching pong is queued automatically.
    PingReceived { payload: Vec<u8> },
    /// A pong arrived.
    PongReceived { payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Client: request sent, awaiting the server's response head.
    ClientHandshake,
    /// Server: awaiting the client's request head.
    ServerHandshake,
    /// Server: request validated, awaiting `accept()`.
    PendingAccept,
    Open,
    /// We sent a close frame and await the peer's reply.
    LocalClosing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
    Text,
    Binary,
}

/// An application operation issued before the opening handshake finished;
/// replayed in order once the connection opens. A client MUST NOT put frames
/// on the wire before the server's handshake response
/// (https://tools.ietf.org/html/rfc6455#section-4.1).
#[derive(Debug)]
enum PendingOp {
    Data(Message),
    Ping(Vec<u8>),
    Close(u16, Option<String>),
}

#[derive(Debug)]
pub(crate) struct ProtocolEngine {
    role: Role,
    state: State,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    events: VecDeque<Event>,
    rng: ChaCha20Rng,
    /// Client: the Sec-WebSocket-Key the response must answer.
    client_key: Option<String>,
    /// Server: the request key held until `accept()`.
    pending_key: Option<String>,
    /// Type of the fragmented message currently being received.
    incoming: Option<DataKind>,
    /// Bytes of a UTF-8 code point split across text fragments.
    utf8_tail: Vec<u8>,
    /// Operations issued before the handshake finished.
    pending: Vec<PendingOp>,
}

impl ProtocolEngine {
    /// Creates a client-role engine with the opening-handshake request
    /// already queued for sending.
    pub(crate) fn client(host: &str, resource: &str) -> Self {
        let mut rng = ChaCha20Rng::from_entropy();
        let key = handshake::generate_key(&mut rng);
        let outbound = handshake::make_request(host, resource, &key);
        Self {
            role: Role::Client,
            state: State::ClientHandshake,
            inbound: Vec::new(),
            outbound,
            events: VecDeque::new(),
            rng,
            client_key: Some(key),
            pending_key: None,
            incoming: None,
            utf8_tail: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Creates a server-role engine awaiting a client request.
    pub(crate) fn server() -> Self {
        Self {
            role: Role::Server,
            state: State::ServerHandshake,
            inbound: Vec::new(),
            outbound: Vec::new(),
            events: VecDeque::new(),
            rng: ChaCha20Rng::from_entropy(),
            client_key: None,
            pending_key: None,
            incoming: None,
            utf8_tail: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Whether the close handshake has completed or the engine has failed
    /// the connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Feeds raw network bytes into the engine. Protocol violations do not
    /// surface here; they are reported as a [`Event::ConnectionClosed`].
    pub(crate) fn receive_bytes(&mut self, data: &[u8]) {
        if self.state == State::Closed {
            return;
        }
        self.inbound.extend_from_slice(data);
        self.process_inbound();
    }

    /// Drains the pending protocol events, in order.
    pub(crate) fn events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }

    /// Takes all pending outbound bytes.
    pub(crate) fn bytes_to_send(&mut self) -> Vec<u8> {
        mem::take(&mut self.outbound)
    }

    /// Server: queues the 101 response for a previously reported
    /// [`Event::ConnectionRequested`].
    pub(crate) fn accept(&mut self) {
        if self.state == State::PendingAccept {
            if let Some(key) = self.pending_key.take() {
                self.outbound.extend_from_slice(&handshake::make_response(&key));
                self.enter_open();
                // frames may have been buffered behind the request head
                self.process_inbound();
            }
        }
    }

    /// Queues a data frame for the message.
    pub(crate) fn send_data(&mut self, message: Message) -> Result<(), FrameError> {
        match self.state {
            State::Open => match message {
                Message::Text(payload) => self.queue_frame(OpCode::Text, payload.into_bytes()),
                Message::Binary(payload) => self.queue_frame(OpCode::Binary, payload),
            },
            State::ClientHandshake | State::ServerHandshake | State::PendingAccept => {
                self.pending.push(PendingOp::Data(message));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Queues a ping frame.
    pub(crate) fn ping(&mut self, payload: Vec<u8>) -> Result<(), FrameError> {
        match self.state {
            State::Open => self.queue_frame(OpCode::Ping, payload),
            State::ClientHandshake | State::ServerHandshake | State::PendingAccept => {
                self.pending.push(PendingOp::Ping(payload));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Queues a close frame and starts the local half of the close
    /// handshake.
    pub(crate) fn close(&mut self, code: u16, reason: Option<&str>) -> Result<(), FrameError> {
        match self.state {
            State::Open => {
                let mut payload = code.to_be_bytes().to_vec();
                if let Some(reason) = reason {
                    payload.extend_from_slice(reason.as_bytes());
                }
                self.queue_frame(OpCode::Close, payload)?;
                self.state = State::LocalClosing;
                Ok(())
            }
            State::ClientHandshake | State::ServerHandshake | State::PendingAccept => {
                self.pending
                    .push(PendingOp::Close(code, reason.map(str::to_owned)));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Opens the connection and replays operations that were waiting on the
    /// handshake. Payload sizes were validated when the ops were queued.
    fn enter_open(&mut self) {
        self.state = State::Open;
        for op in mem::take(&mut self.pending) {
            let _ = match op {
                PendingOp::Data(message) => self.send_data(message),
                PendingOp::Ping(payload) => self.ping(payload),
                PendingOp::Close(code, reason) => self.close(code, reason.as_deref()),
            };
        }
    }

    fn process_inbound(&mut self) {
        loop {
            match self.state {
                State::ClientHandshake | State::ServerHandshake => {
                    let Some(head) = self.take_head() else { break };
                    self.handle_head(head);
                }
                State::PendingAccept => break,
                State::Open | State::LocalClosing => {
                    match parse_frame(&self.inbound, self.role) {
                        Ok(Some((frame, used))) => {
                            self.inbound.drain(..used);
                            self.handle_frame(frame);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            self.fail_from(err);
                            break;
                        }
                    }
                }
                State::Closed => {
                    self.inbound.clear();
                    break;
                }
            }
        }
    }

    /// Splits the HTTP head (up to the blank line) off the inbound buffer.
    fn take_head(&mut self) -> Option<Vec<u8>> {
        let end = self
            .inbound
            .windows(4)
            .position(|window| window == b"\r\n\r\n")?;
        let mut head: Vec<u8> = self.inbound.drain(..end + 4).collect();
        head.truncate(end);
        Some(head)
    }

    fn handle_head(&mut self, head: Vec<u8>) {
        let Ok(head) = String::from_utf8(head) else {
            self.fail_handshake("handshake head is not valid UTF-8");
            return;
        };
        match self.state {
            State::ClientHandshake => {
                let key = self.client_key.take().unwrap_or_default();
                match handshake::parse_response(&head, &key) {
                    Ok(()) => {
                        self.events.push_back(Event::ConnectionEstablished);
                        self.enter_open();
                    }
                    Err(message) => self.fail_handshake(message),
                }
            }
            State::ServerHandshake => match handshake::parse_request(&head) {
                Ok(request) => {
                    self.pending_key = Some(request.key);
                    self.events.push_back(Event::ConnectionRequested {
                        resource: request.resource,
                    });
                    self.state = State::PendingAccept;
                }
                Err(message) => {
                    self.outbound
                        .extend_from_slice(&handshake::make_reject_response());
                    self.fail_handshake(message);
                }
            },
            _ => (),
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.opcode {
            OpCode::Text | OpCode::Binary | OpCode::Continuation => self.handle_data(frame),
            OpCode::Close => self.handle_close(frame.payload),
            OpCode::Ping => {
                // no ping processing while closing
                if self.state == State::Open {
                    // the pong is queued automatically; the owner only has
                    // to flush it
                    let _ = self.queue_frame(OpCode::Pong, frame.payload.clone());
                    self.events.push_back(Event::PingReceived {
                        payload: frame.payload,
                    });
                }
            }
            OpCode::Pong => {
                self.events.push_back(Event::PongReceived {
                    payload: frame.payload,
                });
            }
        }
    }

    fn handle_data(&mut self, frame: Frame) {
        if self.state == State::LocalClosing {
            // no data processing while closing
            return;
        }
        let kind = match frame.opcode {
            OpCode::Continuation => match self.incoming {
                Some(kind) => kind,
                None => {
                    self.fail(
                        close_code::PROTOCOL_ERROR,
                        "continuation frame but nothing to continue",
                    );
                    return;
                }
            },
            OpCode::Text | OpCode::Binary if self.incoming.is_some() => {
                self.fail(
                    close_code::PROTOCOL_ERROR,
                    "data frame while waiting for more fragments",
                );
                return;
            }
            OpCode::Text => DataKind::Text,
            OpCode::Binary => DataKind::Binary,
            _ => unreachable!("control opcode in handle_data"),
        };

        let message_finished = frame.fin;
        self.incoming = if message_finished { None } else { Some(kind) };
        match kind {
            DataKind::Binary => self.events.push_back(Event::BytesReceived {
                data: frame.payload,
                message_finished,
            }),
            DataKind::Text => match self.take_text(frame.payload, message_finished) {
                Ok(data) => self.events.push_back(Event::TextReceived {
                    data,
                    message_finished,
                }),
                Err(message) => self.fail(close_code::INVALID_FRAME_PAYLOAD_DATA, message),
            },
        }
    }

    /// Decodes a text fragment, carrying a code point split across frame
    /// boundaries over to the next fragment.
    fn take_text(&mut self, data: Vec<u8>, message_finished: bool) -> Result<String, &'static str> {
        let mut buf = mem::take(&mut self.utf8_tail);
        buf.extend_from_slice(&data);
        match std::str::from_utf8(&buf) {
            Ok(_) => (),
            Err(err) if err.error_len().is_none() && !message_finished => {
                self.utf8_tail = buf.split_off(err.valid_up_to());
            }
            Err(_) => return Err("invalid UTF-8 in text message"),
        }
        String::from_utf8(buf).map_err(|_| "invalid UTF-8 in text message")
    }

    fn handle_close(&mut self, payload: Vec<u8>) {
        // https://tools.ietf.org/html/rfc6455#section-5.5.1
        let (code, reason) = match payload.len() {
            0 => (close_code::NO_STATUS_RCVD, None),
            1 => {
                self.fail(close_code::PROTOCOL_ERROR, "close frame with malformed payload");
                return;
            }
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                match String::from_utf8(payload[2..].to_vec()) {
                    Ok(reason) if reason.is_empty() => (code, None),
                    Ok(reason) => (code, Some(reason)),
                    Err(_) => {
                        self.fail(
                            close_code::INVALID_FRAME_PAYLOAD_DATA,
                            "invalid UTF-8 in close reason",
                        );
                        return;
                    }
                }
            }
        };

        if self.state == State::Open {
            // echo the peer's code back to complete the handshake
            let echo = if code == close_code::NO_STATUS_RCVD {
                Vec::new()
            } else {
                code.to_be_bytes().to_vec()
            };
            let _ = self.queue_frame(OpCode::Close, echo);
        }
        self.events.push_back(Event::ConnectionClosed { code, reason });
        self.state = State::Closed;
    }

    fn fail_from(&mut self, err: FrameError) {
        self.fail(close_code::PROTOCOL_ERROR, &err.to_string());
    }

    fn fail_handshake(&mut self, message: &str) {
        self.events.push_back(Event::ConnectionClosed {
            code: close_code::PROTOCOL_ERROR,
            reason: Some(message.to_owned()),
        });
        self.state = State::Closed;
        self.inbound.clear();
    }

    /// Fails the connection: queue a close frame if one can still be sent,
    /// report the closure, and stop parsing.
    fn fail(&mut self, code: u16, reason: &str) {
        if self.state == State::Open {
            let mut payload = code.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            // reasons generated here are far below the 125-byte control limit
            let _ = self.queue_frame(OpCode::Close, payload);
        }
        self.events.push_back(Event::ConnectionClosed {
            code,
            reason: Some(reason.to_owned()),
        });
        self.state = State::Closed;
        self.inbound.clear();
    }

    fn queue_frame(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<(), FrameError> {
        let masking_key = match self.role {
            // frames sent by the client MUST be masked
            // (https://tools.ietf.org/html/rfc6455#section-5.3)
            Role::Client => {
                let mut key = [0u8; 4];
                self.rng.fill_bytes(&mut key);
                Some(key)
            }
            Role::Server => None,
        };
        encode_frame(opcode, true, payload, masking_key, &mut self.outbound)
    }
}
