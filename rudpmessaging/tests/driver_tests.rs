//! Driver tests over in-memory duplex pipes: two sessions talk through
//! `tokio::io::duplex` with no real sockets involved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use rudpstream::config::MessagingConfig;
use rudpstream::stream::{ChannelHeader, TransportStream};
use rudpmessaging::driver::run_session;
use rudpmessaging::tcp::{SessionEvent, SessionState, TcpMessaging};

struct Side {
    session: Arc<Mutex<TcpMessaging>>,
    receive: TransportStream,
    send: TransportStream,
    kick: Arc<Notify>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

fn spawn_side(
    config: MessagingConfig,
    io: tokio::io::DuplexStream,
) -> (Side, tokio::task::JoinHandle<std::io::Result<()>>) {
    let receive = TransportStream::new();
    let send = TransportStream::new();
    let session = Arc::new(Mutex::new(TcpMessaging::new(&config, &receive, &send)));
    let kick = Arc::new(Notify::new());
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(run_session(session.clone(), io, tx, kick.clone()));
    (
        Side {
            session,
            receive,
            send,
            kick,
            events: rx,
        },
        task,
    )
}

async fn wait_for_buffers(stream: &TransportStream, count: usize) {
    for _ in 0..200 {
        if stream.reader().total_buffers() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} buffers, found {}", stream.reader().total_buffers());
}

#[tokio::test]
async fn messages_flow_both_ways_over_a_duplex_pipe() {
    let (io_a, io_b) = tokio::io::duplex(64 * 1024);
    let config = MessagingConfig::default();
    let (a, _task_a) = spawn_side(config.clone(), io_a);
    let (b, _task_b) = spawn_side(config, io_b);

    a.send.writer().write(Bytes::from_static(b"from a"), None);
    a.kick.notify_one();
    wait_for_buffers(&b.receive, 1).await;
    let (message, _) = b.receive.reader().read_buffer().unwrap();
    assert_eq!(&message[..], b"from a");

    b.send.writer().write(Bytes::from_static(b"from b"), None);
    b.kick.notify_one();
    wait_for_buffers(&a.receive, 1).await;
    let (message, _) = a.receive.reader().read_buffer().unwrap();
    assert_eq!(&message[..], b"from b");
}

#[tokio::test]
async fn channel_tags_survive_the_pipe() {
    let (io_a, io_b) = tokio::io::duplex(64 * 1024);
    let config = MessagingConfig {
        frames_have_channel_number: true,
        ..MessagingConfig::default()
    };
    let (a, _task_a) = spawn_side(config.clone(), io_a);
    let (b, _task_b) = spawn_side(config, io_b);

    a.send.writer().write(
        Bytes::from_static(b"tagged"),
        Some(Arc::new(ChannelHeader { channel_id: 77 })),
    );
    a.kick.notify_one();
    wait_for_buffers(&b.receive, 1).await;

    let (message, header) = b.receive.reader().read_buffer().unwrap();
    assert_eq!(&message[..], b"tagged");
    let header = header.expect("channel tag");
    assert_eq!(
        header
            .as_any()
            .downcast_ref::<ChannelHeader>()
            .unwrap()
            .channel_id,
        77
    );
}

#[tokio::test]
async fn oversize_frame_terminates_the_receiving_session() {
    let (io_a, io_b) = tokio::io::duplex(64 * 1024);
    let config = MessagingConfig {
        max_message_size: 1024,
        ..MessagingConfig::default()
    };
    let (a, _task_a) = spawn_side(config.clone(), io_a);
    let (mut b, task_b) = spawn_side(config, io_b);

    // 2000 bytes exceeds b's 1024 limit
    a.send.writer().write(Bytes::from(vec![0u8; 2000]), None);
    a.kick.notify_one();

    let mut saw_terminal_412 = false;
    for _ in 0..200 {
        match tokio::time::timeout(Duration::from_millis(50), b.events.recv()).await {
            Ok(Some(SessionEvent::StateChanged {
                state: SessionState::Shutdown,
                error,
            })) => {
                assert_eq!(error.expect("error carried").0, 412);
                saw_terminal_412 = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => continue,
        }
    }
    assert!(saw_terminal_412, "session should die with 412");
    assert_eq!(b.receive.reader().total_buffers(), 0);
    let _ = task_b.await;
    assert_eq!(b.session.lock().state(), SessionState::Shutdown);
}

#[tokio::test]
async fn peer_close_shuts_the_session_down() {
    let (io_a, io_b) = tokio::io::duplex(64 * 1024);
    let config = MessagingConfig::default();
    let (a, task_a) = spawn_side(config.clone(), io_a);
    let (b, task_b) = spawn_side(config, io_b);

    // a tears down immediately; b must observe the close
    a.session.lock().cancel();
    a.kick.notify_one();
    let _ = task_a.await;

    for _ in 0..200 {
        if b.session.lock().state() == SessionState::Shutdown {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.session.lock().state(), SessionState::Shutdown);
    let _ = task_b.await;
}
