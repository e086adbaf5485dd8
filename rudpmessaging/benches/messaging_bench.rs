// Framed-messaging benchmarks using criterion.
//
// Measures:
//   - TCP frame serialisation throughput (both modes)
//   - Inbound ring parsing throughput

use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use bytes::Bytes;
use rudpstream::config::MessagingConfig;
use rudpstream::stream::{ChannelHeader, Header, TransportStream};
use rudpmessaging::tcp::TcpMessaging;

fn config(tagged: bool) -> MessagingConfig {
    MessagingConfig {
        frames_have_channel_number: tagged,
        ..MessagingConfig::default()
    }
}

fn bench_frame_serialise(c: &mut Criterion) {
    let sizes: &[usize] = &[256, 4096, 65536];

    let mut group = c.benchmark_group("frame_serialise");
    for &size in sizes {
        for tagged in [false, true] {
            let label = if tagged { "tagged" } else { "plain" };
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(label, format!("{size}B")),
                &size,
                |b, &size| {
                    let payload = Bytes::from(vec![0x5Au8; size]);
                    b.iter(|| {
                        let receive = TransportStream::new();
                        let send = TransportStream::new();
                        let mut session =
                            TcpMessaging::new(&config(tagged), &receive, &send);
                        session.connected(Instant::now());
                        let header = tagged
                            .then(|| Arc::new(ChannelHeader { channel_id: 1 }) as Header);
                        send.writer().write(payload.clone(), header);
                        session.pump_send().unwrap();
                        black_box(session.poll_transmit(usize::MAX));
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_frame_parse(c: &mut Criterion) {
    let sizes: &[usize] = &[256, 4096, 65536];

    let mut group = c.benchmark_group("frame_parse");
    for &size in sizes {
        // pre-serialise one frame
        let receive = TransportStream::new();
        let send = TransportStream::new();
        let mut sender = TcpMessaging::new(&config(false), &receive, &send);
        sender.connected(Instant::now());
        send.writer().write(Bytes::from(vec![0xA5u8; size]), None);
        sender.pump_send().unwrap();
        let wire = sender.poll_transmit(usize::MAX).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size}B")),
            &wire,
            |b, wire| {
                b.iter(|| {
                    let receive = TransportStream::new();
                    let send = TransportStream::new();
                    let mut session = TcpMessaging::new(&config(false), &receive, &send);
                    session.connected(Instant::now());
                    session.on_socket_bytes(wire).unwrap();
                    black_box(receive.reader().read_buffer());
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_frame_serialise, bench_frame_parse);
criterion_main!(benches);
