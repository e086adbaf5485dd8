//! tokio driver for a [`Transport`] over a real UDP socket.
//!
//! The protocol core is synchronous; this loop is the only place that
//! awaits. It pumps inbound datagrams, requester retransmissions and
//! timer deadlines through the transport, and forwards the non-wire
//! outputs to the application as [`TransportEvent`]s. Callers wake the
//! loop through the `kick` handle after writing into a channel's send
//! stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::trace;

use crate::channel::ChannelState;
use crate::requester::StunRequesterEngine;
use crate::stun::{StunClass, StunCodec};
use crate::transport::{Transport, TransportOutput, TransportState};

/// Application-visible transport activity.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ChannelWaiting,
    StateChanged {
        state: TransportState,
        error: Option<(u16, String)>,
    },
    ChannelStateChanged {
        local_channel: u16,
        state: ChannelState,
        error: Option<(u16, String)>,
    },
}

/// Idle wake interval when nothing is scheduled.
const IDLE_TICK: Duration = Duration::from_secs(30);

/// Run the transport until it reaches `Shutdown` or the socket fails.
pub async fn run_transport<C: StunCodec>(
    transport: Arc<Mutex<Transport>>,
    socket: UdpSocket,
    codec: C,
    events: mpsc::UnboundedSender<TransportEvent>,
    kick: Arc<Notify>,
) -> std::io::Result<()> {
    let mut engine = StunRequesterEngine::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        // push everything the core wants onto the wire
        let outputs = transport.lock().drain_outputs();
        let mut terminal = false;
        for output in outputs {
            match output {
                TransportOutput::SendPacket { dest, packet } => {
                    socket.send_to(&packet, dest).await?;
                }
                TransportOutput::SendStun { dest, packet } => {
                    socket.send_to(&codec.encode(&packet), dest).await?;
                }
                TransportOutput::IssueStunRequest { id, dest, packet } => {
                    engine.register(id, dest, packet, Instant::now());
                }
                TransportOutput::CancelStunRequest(id) => {
                    engine.cancel(id);
                }
                TransportOutput::ChannelWaiting => {
                    let _ = events.send(TransportEvent::ChannelWaiting);
                }
                TransportOutput::StateChanged { state, error } => {
                    terminal |= state == TransportState::Shutdown;
                    let _ = events.send(TransportEvent::StateChanged { state, error });
                }
                TransportOutput::ChannelStateChanged {
                    local_channel,
                    state,
                    error,
                } => {
                    let _ = events.send(TransportEvent::ChannelStateChanged {
                        local_channel,
                        state,
                        error,
                    });
                }
            }
        }
        if terminal {
            return Ok(());
        }

        // requester retransmissions and give-ups
        let now = Instant::now();
        let (sends, timeouts) = engine.poll_expired(now);
        for send in sends {
            socket.send_to(&codec.encode(&send.packet), send.dest).await?;
        }
        if !timeouts.is_empty() {
            let mut guard = transport.lock();
            for id in timeouts {
                guard.on_stun_request_timeout(id, now);
            }
            continue; // fresh outputs to flush
        }

        // earliest thing worth waking for
        let mut deadline = transport.lock().next_timeout();
        if let Some(engine_deadline) = engine.next_timeout() {
            deadline = Some(deadline.map_or(engine_deadline, |d| d.min(engine_deadline)));
        }
        let wake = deadline.unwrap_or_else(|| now + IDLE_TICK);

        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                let now = Instant::now();
                let mut guard = transport.lock();
                if !guard.handle_packet(&buf[..len], now) {
                    match codec.decode(&buf[..len]) {
                        Some(stun)
                            if matches!(
                                stun.class,
                                StunClass::SuccessResponse | StunClass::ErrorResponse
                            ) =>
                        {
                            if let Some(id) = engine.match_response(&stun) {
                                engine.on_response(id);
                                guard.on_stun_response(id, &stun, now);
                            }
                        }
                        Some(stun) => {
                            let local_frag = guard.local_frag().to_string();
                            let remote_frag = guard.remote_frag().to_string();
                            guard.handle_stun(&stun, &local_frag, &remote_frag, now);
                        }
                        None => {
                            trace!(%from, len, "datagram was neither rudp nor stun");
                        }
                    }
                }
            }
            _ = sleep_until(TokioInstant::from_std(wake)) => {
                transport.lock().on_timer(Instant::now());
            }
            _ = kick.notified() => {
                transport.lock().notify_write_ready(Instant::now());
            }
        }
    }
}
