//! WebSocket support: the RFC 6455 handshake derivation, the frame
//! codec, and the post-upgrade connection state machine.

pub(crate) mod frame;
pub(crate) mod handshake;

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::error::{Error, Parse};

use self::frame::{Frame, OpCode};

/// Events surfaced to the dispatcher after feeding input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WsEvent {
    Text(String),
    Binary(Vec<u8>),
    /// A close frame arrived; the reply close (if any) is already
    /// queued. The socket should be torn down once output drains.
    Close { code: Option<u16> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WsState {
    Open,
    /// We sent or mirrored a close; flush and tear down.
    Closing,
}

/// The per-socket WebSocket machine. Owned by one reactor thread; all
/// sends from other threads arrive over the event bridge.
pub(crate) struct WsConn {
    input: bytes::BytesMut,
    /// Reassembly buffer for a fragmented message.
    fragments: Option<(OpCode, Vec<u8>)>,
    /// Framed messages awaiting write, in send order.
    send_queue: VecDeque<Vec<u8>>,
    /// Offset into the front of the queue.
    wrote: usize,
    state: WsState,
    path: String,
}

impl WsConn {
    pub(crate) fn new(path: String) -> WsConn {
        WsConn {
            input: bytes::BytesMut::new(),
            fragments: None,
            send_queue: VecDeque::new(),
            wrote: 0,
            state: WsState::Open,
            path,
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state == WsState::Closing
    }

    /// Feeds bytes from the socket, returning every message event they
    /// complete. Pings are answered inline; pongs are dropped.
    pub(crate) fn handle_input(&mut self, bytes: &[u8]) -> crate::Result<Vec<WsEvent>> {
        self.input.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            let (frame, consumed) = match frame::parse(&self.input)? {
                Some(parsed) => parsed,
                None => break,
            };
            let _ = self.input.split_to(consumed);
            if let Some(event) = self.handle_frame(frame)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn handle_frame(&mut self, frame: Frame) -> crate::Result<Option<WsEvent>> {
        trace!("ws frame: {:?} ({} bytes)", frame.opcode, frame.payload.len());
        match frame.opcode {
            OpCode::Ping => {
                self.enqueue(frame::encode(OpCode::Pong, &frame.payload));
                Ok(None)
            }
            OpCode::Pong => Ok(None),
            OpCode::Close => {
                // A close code is 0 or 2+ bytes, never 1.
                if frame.payload.len() == 1 {
                    return Err(Error::new_parse(Parse::WebSocket));
                }
                let code = if frame.payload.len() >= 2 {
                    Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
                } else {
                    None
                };
                if self.state == WsState::Open {
                    // Mirror the close before tearing down.
                    self.enqueue(frame::encode(OpCode::Close, &frame.payload));
                    self.state = WsState::Closing;
                }
                Ok(Some(WsEvent::Close { code }))
            }
            OpCode::Text | OpCode::Binary => {
                if !frame.fin {
                    if self.fragments.is_some() {
                        return Err(Error::new_parse(Parse::WebSocket));
                    }
                    self.fragments = Some((frame.opcode, frame.payload));
                    return Ok(None);
                }
                if self.fragments.is_some() {
                    // A new data frame may not interleave with an
                    // unfinished fragmented message.
                    return Err(Error::new_parse(Parse::WebSocket));
                }
                self.message_event(frame.opcode, frame.payload).map(Some)
            }
            OpCode::Continuation => {
                let (opcode, mut assembled) = match self.fragments.take() {
                    Some(pending) => pending,
                    None => return Err(Error::new_parse(Parse::WebSocket)),
                };
                assembled.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.message_event(opcode, assembled).map(Some)
                } else {
                    self.fragments = Some((opcode, assembled));
                    Ok(None)
                }
            }
        }
    }

    fn message_event(&mut self, opcode: OpCode, payload: Vec<u8>) -> crate::Result<WsEvent> {
        match opcode {
            OpCode::Text => match String::from_utf8(payload) {
                Ok(text) => Ok(WsEvent::Text(text)),
                Err(_) => {
                    debug!("ws text frame with invalid utf-8");
                    Err(Error::new_parse(Parse::WebSocket))
                }
            },
            OpCode::Binary => Ok(WsEvent::Binary(payload)),
            _ => Err(Error::new_parse(Parse::WebSocket)),
        }
    }

    pub(crate) fn send_text(&mut self, text: &str) {
        self.enqueue(frame::encode(OpCode::Text, text.as_bytes()));
    }

    pub(crate) fn send_binary(&mut self, data: &[u8]) {
        self.enqueue(frame::encode(OpCode::Binary, data));
    }

    /// Queues a close frame. Subsequent sends are dropped.
    pub(crate) fn close(&mut self, code: u16, reason: &str) {
        if self.state == WsState::Closing {
            return;
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.enqueue(frame::encode(OpCode::Close, &payload));
        self.state = WsState::Closing;
    }

    fn enqueue(&mut self, framed: Vec<u8>) {
        if self.state == WsState::Closing && !framed.is_empty() {
            // Only the close frame itself goes out after closing starts.
            if framed[0] & 0x0F != OpCode::Close as u8 {
                return;
            }
        }
        self.send_queue.push_back(framed);
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// The next framed bytes to write, in queue order.
    pub(crate) fn output(&self) -> &[u8] {
        match self.send_queue.front() {
            Some(front) => &front[self.wrote..],
            None => &[],
        }
    }

    pub(crate) fn consume_output(&mut self, n: usize) {
        self.wrote += n;
        if let Some(front) = self.send_queue.front() {
            if self.wrote >= front.len() {
                self.send_queue.pop_front();
                self.wrote = 0;
            }
        }
    }
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("queued", &self.send_queue.len())
            .finish()
    }
}
