//! Message-oriented adaptation over an RUDP channel's stream pair.
//!
//! A channel delivers an ordered byte stream; this layer restores
//! message boundaries with a `u32` length prefix. Four stream ends are
//! wired at construction: outer send/receive face the application, wire
//! send/receive face the channel.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use rudpstream::config::MessagingConfig;
use rudpstream::stream::{StreamReader, StreamWriter, TransportStream};

use crate::error::{MessagingError, Result};
use crate::tcp::{SessionEvent, SessionState};

pub struct RudpMessaging {
    state: SessionState,
    error: Option<(u16, String)>,
    max_message_size: usize,

    outer_receive: StreamWriter,
    outer_send: StreamReader,
    wire_receive: StreamReader,
    wire_send: StreamWriter,

    events: VecDeque<SessionEvent>,
}

impl RudpMessaging {
    /// `outer_*` face the application; `wire_*` are the channel's
    /// receive and send streams.
    pub fn new(
        config: &MessagingConfig,
        outer_receive: &TransportStream,
        outer_send: &TransportStream,
        wire_receive: &TransportStream,
        wire_send: &TransportStream,
    ) -> Self {
        Self {
            state: SessionState::Pending,
            error: None,
            max_message_size: config.max_message_size,
            outer_receive: outer_receive.writer(),
            outer_send: outer_send.reader(),
            wire_receive: wire_receive.reader(),
            wire_send: wire_send.writer(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&(u16, String)> {
        self.error.as_ref()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// The underlying channel connected.
    pub fn connected(&mut self, _now: Instant) {
        if self.state == SessionState::Pending {
            self.set_state(SessionState::Connected);
        }
    }

    /// Application queued outbound messages: wrap each in a length
    /// prefix and hand it to the channel.
    pub fn on_outer_send_ready(&mut self) {
        if self.state != SessionState::Connected {
            return;
        }
        while self.outer_send.total_buffers() > 0 {
            let Some((message, _header)) = self.outer_send.read_buffer() else {
                break;
            };
            let mut framed = BytesMut::with_capacity(4 + message.len());
            framed.put_u32(message.len() as u32);
            framed.extend_from_slice(&message);
            trace!(size = message.len(), "message framed for wire");
            self.wire_send.write(framed.freeze(), None);
        }
    }

    /// The channel delivered bytes: reassemble whole messages and hand
    /// them to the application, one buffer per message.
    pub fn on_wire_receive_ready(&mut self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        loop {
            let Some(length) = self.wire_receive.peek_u32(0) else {
                break;
            };
            let length = length as usize;
            if length > self.max_message_size {
                let err = MessagingError::PreconditionFailed {
                    size: length,
                    max: self.max_message_size,
                };
                self.fail(&err);
                return Err(err);
            }
            if self.wire_receive.total_available() < 4 + length {
                break; // message still in flight
            }
            self.wire_receive.skip(4);
            let mut message = vec![0u8; length];
            let mut filled = 0;
            while filled < length {
                let (count, _) = self.wire_receive.read(&mut message[filled..]);
                if count == 0 {
                    break;
                }
                filled += count;
            }
            message.truncate(filled);
            self.outer_receive.write(message.into(), None);
        }
        Ok(())
    }

    /// Graceful teardown mirroring the channel's lifecycle.
    pub fn shutdown(&mut self, _now: Instant) {
        match self.state {
            SessionState::Shutdown => return,
            _ => {}
        }
        self.on_outer_send_ready();
        self.set_state(SessionState::Shutdown);
    }

    /// The channel went down underneath us.
    pub fn on_channel_closed(&mut self, error: Option<(u16, String)>) {
        if self.state == SessionState::Shutdown {
            return;
        }
        debug!(?error, "channel closed under messaging layer");
        self.error = error;
        self.set_state(SessionState::Shutdown);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.events.push_back(SessionEvent::StateChanged {
            state,
            error: self.error.clone(),
        });
    }

    fn fail(&mut self, err: &MessagingError) {
        if self.state == SessionState::Shutdown {
            warn!(code = err.code(), %err, "error after terminal state");
            return;
        }
        self.error = Some((err.code(), err.to_string()));
        self.set_state(SessionState::Shutdown);
    }
}
