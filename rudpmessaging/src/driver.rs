//! tokio pump for a [`TcpMessaging`] session over any async byte
//! stream.
//!
//! Generic over `AsyncRead + AsyncWrite` so tests can run sessions over
//! in-memory duplex pipes; production callers hand in a
//! `tokio::net::TcpStream`. Wake the loop through `kick` after writing
//! into the session's send stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant as TokioInstant};

use crate::tcp::{SessionEvent, SessionState, TcpMessaging};

/// Idle wake interval when no linger timer is armed.
const IDLE_TICK: Duration = Duration::from_secs(30);

/// Largest chunk handed to the socket per write.
const WRITE_CHUNK: usize = 16 * 1024;

/// Run the session until it reaches `Shutdown` or the stream fails.
pub async fn run_session<S>(
    session: Arc<Mutex<TcpMessaging>>,
    io: S,
    events: mpsc::UnboundedSender<SessionEvent>,
    kick: Arc<Notify>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(io);
    let mut buf = vec![0u8; WRITE_CHUNK];

    // the byte stream exists, so the connection is up
    session.lock().connected(Instant::now());

    loop {
        let drained = session.lock().drain_events();
        let mut terminal = false;
        for event in drained {
            match &event {
                SessionEvent::StateChanged { state, .. } => {
                    terminal |= *state == SessionState::Shutdown;
                }
                // the select below always has a read armed, which is
                // exactly what a post-background probe needs
                SessionEvent::ForceRead => {}
            }
            let _ = events.send(event);
        }
        if terminal {
            let _ = write_half.shutdown().await;
            return Ok(());
        }

        let chunk = {
            let mut guard = session.lock();
            if guard.pump_send().is_err() {
                continue; // session failed; next pass drains the event
            }
            guard.poll_transmit(WRITE_CHUNK)
        };
        if let Some(chunk) = chunk {
            if let Err(err) = write_half.write_all(&chunk).await {
                session.lock().on_socket_error(&err.to_string());
                continue;
            }
            continue;
        }

        let now = Instant::now();
        let wake = session.lock().next_timeout().unwrap_or(now + IDLE_TICK);

        tokio::select! {
            read = read_half.read(&mut buf) => {
                let now = Instant::now();
                match read {
                    Ok(0) => session.lock().on_peer_closed(now),
                    Ok(len) => {
                        // a framing failure surfaces via the event drain
                        let _ = session.lock().on_socket_bytes(&buf[..len]);
                    }
                    Err(err) => session.lock().on_socket_error(&err.to_string()),
                }
            }
            _ = sleep_until(TokioInstant::from_std(wake)) => {
                session.lock().on_timer(Instant::now());
            }
            _ = kick.notified() => {}
        }
    }
}
