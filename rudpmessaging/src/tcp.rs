//! Length-prefixed framed messaging over a TCP byte stream.
//!
//! The session reuses the TransportStream pipe pair: buffers read from
//! the send stream are serialised with a `u32` length prefix (and, in
//! channel-tagged mode, a leading `u32` channel id) into an outbound
//! ring; inbound socket bytes accumulate in a receive ring from which
//! only whole frames are delivered. Partial frames wait in the ring.
//!
//! The session is synchronous; `driver::run_session` pumps it over an
//! actual socket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use rudpstream::config::MessagingConfig;
use rudpstream::stream::{ChannelHeader, Header, StreamReader, StreamWriter, TransportStream};

use crate::error::{MessagingError, Result};

/// Frame layout, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// `u32_be(length) || payload`
    LengthOnly,
    /// `u32_be(channel_id) || u32_be(length) || payload`
    ChannelAndLength,
}

impl FrameMode {
    fn header_size(self) -> usize {
        match self {
            FrameMode::LengthOnly => 4,
            FrameMode::ChannelAndLength => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connected,
    ShuttingDown,
    Shutdown,
}

/// Activity the driver and application observe.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        error: Option<(u16, String)>,
    },
    /// Returning from background: read the socket once to find out
    /// whether the peer closed during suspension.
    ForceRead,
}

pub struct TcpMessaging {
    state: SessionState,
    error: Option<(u16, String)>,
    mode: FrameMode,
    max_message_size: usize,

    recv_ring: BytesMut,
    send_ring: BytesMut,

    receive_writer: StreamWriter,
    send_reader: StreamReader,

    linger_deadline: Option<Instant>,
    events: VecDeque<SessionEvent>,
}

impl TcpMessaging {
    /// `receive_stream` gets whole inbound frames; `send_stream` is
    /// read for outbound buffers.
    pub fn new(
        config: &MessagingConfig,
        receive_stream: &TransportStream,
        send_stream: &TransportStream,
    ) -> Self {
        let mode = if config.frames_have_channel_number {
            FrameMode::ChannelAndLength
        } else {
            FrameMode::LengthOnly
        };
        Self {
            state: SessionState::Pending,
            error: None,
            mode,
            max_message_size: config.max_message_size,
            recv_ring: BytesMut::new(),
            send_ring: BytesMut::new(),
            receive_writer: receive_stream.writer(),
            send_reader: send_stream.reader(),
            linger_deadline: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&(u16, String)> {
        self.error.as_ref()
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.linger_deadline
    }

    /// The socket is established: on accept for inbound sessions, on
    /// the first write-ready edge for outbound ones.
    pub fn connected(&mut self, _now: Instant) {
        if self.state == SessionState::Pending {
            self.set_state(SessionState::Connected);
        }
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Feed bytes read from the socket; whole frames flow into the
    /// receive stream, partial frames stay in the ring.
    pub fn on_socket_bytes(&mut self, data: &[u8]) -> Result<()> {
        if matches!(self.state, SessionState::Shutdown) {
            return Ok(());
        }
        self.recv_ring.extend_from_slice(data);

        loop {
            let header = self.mode.header_size();
            if self.recv_ring.len() < header {
                break;
            }

            let (channel, length_offset) = match self.mode {
                FrameMode::LengthOnly => (None, 0),
                FrameMode::ChannelAndLength => {
                    let id = u32::from_be_bytes(
                        self.recv_ring[0..4].try_into().expect("ring bounds"),
                    );
                    (Some(id), 4)
                }
            };
            let length = u32::from_be_bytes(
                self.recv_ring[length_offset..length_offset + 4]
                    .try_into()
                    .expect("ring bounds"),
            ) as usize;

            if length > self.max_message_size {
                let err = MessagingError::PreconditionFailed {
                    size: length,
                    max: self.max_message_size,
                };
                self.fail(&err);
                return Err(err);
            }
            if self.recv_ring.len() < header + length {
                break; // whole frame not here yet
            }

            self.recv_ring.advance(header);
            let payload = self.recv_ring.split_to(length).freeze();
            let stream_header: Option<Header> =
                channel.map(|channel_id| Arc::new(ChannelHeader { channel_id }) as Header);
            trace!(size = length, channel = ?channel, "frame received");
            self.receive_writer.write(payload, stream_header);
        }
        Ok(())
    }

    /// The peer closed the connection.
    pub fn on_peer_closed(&mut self, _now: Instant) {
        if self.state == SessionState::Shutdown {
            return;
        }
        debug!("peer closed tcp session");
        self.set_state(SessionState::Shutdown);
    }

    /// The socket failed.
    pub fn on_socket_error(&mut self, reason: &str) {
        let err = MessagingError::NetworkConnectTimeout(reason.to_string());
        self.fail(&err);
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// Serialise everything queued on the send stream into the
    /// outbound ring.
    pub fn pump_send(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Shutdown) {
            return Ok(());
        }
        while self.send_reader.total_buffers() > 0 {
            let Some((data, header)) = self.send_reader.read_buffer() else {
                break;
            };
            if self.mode == FrameMode::ChannelAndLength {
                let channel = header.as_ref().and_then(|h| {
                    h.as_any()
                        .downcast_ref::<ChannelHeader>()
                        .map(|h| h.channel_id)
                });
                let Some(channel_id) = channel else {
                    let err = MessagingError::ExpectationFailed;
                    self.fail(&err);
                    return Err(err);
                };
                self.send_ring.put_u32(channel_id);
            }
            self.send_ring.put_u32(data.len() as u32);
            self.send_ring.extend_from_slice(&data);
            trace!(size = data.len(), "frame queued");
        }
        Ok(())
    }

    /// Take up to `max` serialised bytes for the socket.
    pub fn poll_transmit(&mut self, max: usize) -> Option<Bytes> {
        if self.send_ring.is_empty() {
            return None;
        }
        let take = self.send_ring.len().min(max);
        Some(self.send_ring.split_to(take).freeze())
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.send_ring.is_empty()
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Graceful shutdown with a linger window for queued data; zero
    /// linger tears down immediately.
    pub fn shutdown(&mut self, linger: Duration, now: Instant) {
        match self.state {
            SessionState::Shutdown => return,
            SessionState::ShuttingDown => return,
            _ => {}
        }
        let _ = self.pump_send();
        if linger.is_zero() {
            self.set_state(SessionState::Shutdown);
            return;
        }
        self.set_state(SessionState::ShuttingDown);
        self.linger_deadline = Some(now + linger);
    }

    pub fn on_timer(&mut self, now: Instant) {
        if self.state == SessionState::ShuttingDown
            && self.linger_deadline.is_some_and(|d| now >= d)
        {
            self.set_state(SessionState::Shutdown);
        }
    }

    /// Returning from background: ask the driver for one read so a
    /// peer close during suspension is noticed.
    pub fn notify_returning_from_background(&mut self) {
        if self.state == SessionState::Connected {
            self.events.push_back(SessionEvent::ForceRead);
        }
    }

    /// Immediate teardown; idempotent.
    pub fn cancel(&mut self) {
        if self.state == SessionState::Shutdown {
            return;
        }
        self.recv_ring.clear();
        self.send_ring.clear();
        self.set_state(SessionState::Shutdown);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!(?state, "tcp session state");
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
        self.recv_ring.clear();
        self.send_ring.clear();
        self.set_state(SessionState::Shutdown);
    }
}
