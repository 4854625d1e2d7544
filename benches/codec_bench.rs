//! SOCKS5 codec and relay benchmarks.
//!
//! Measures frame parsing/encoding and the loopback copy path used once a
//! connection has entered relay.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use s5tunnel::proxy::connection::token_for;
use s5tunnel::proxy::relay::{pump, HalfState};
use s5tunnel::proxy::socks5::{self, reply, TargetAddr, CMD_CONNECT};
use s5tunnel::proxy::{Endpoint, Side, RELAY_BUFFER_SIZE};

fn bench_parse_greeting(c: &mut Criterion) {
    let greeting = [0x05, 0x03, 0x00, 0x01, 0x02];

    c.bench_function("parse_greeting", |b| {
        b.iter(|| black_box(socks5::parse_greeting(black_box(&greeting)).unwrap()))
    });
}

fn bench_parse_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");

    let targets = [
        ("ipv4", TargetAddr::Ip("93.184.216.34:80".parse().unwrap())),
        ("ipv6", TargetAddr::Ip("[2606:2800:220:1::1]:443".parse().unwrap())),
        ("domain", TargetAddr::Domain("example.org".into(), 80)),
    ];

    for (name, target) in targets {
        let mut encoded = BytesMut::new();
        socks5::encode_request(CMD_CONNECT, &target, &mut encoded);

        group.bench_function(name, |b| {
            b.iter(|| black_box(socks5::parse_request(black_box(&encoded)).unwrap()))
        });
    }

    group.finish();
}

fn bench_encode_reply(c: &mut Criterion) {
    let bound: SocketAddr = "10.0.0.1:40000".parse().unwrap();

    c.bench_function("encode_reply", |b| {
        let mut buf = BytesMut::with_capacity(32);
        b.iter(|| {
            buf.clear();
            socks5::encode_reply(reply::SUCCEEDED, Some(bound), &mut buf);
            black_box(buf.len())
        })
    });
}

/// Accepted loopback socket as a non-blocking endpoint plus its client half.
fn endpoint_pair(side: Side) -> (Endpoint, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    let endpoint = Endpoint::new(
        mio::net::TcpStream::from_std(accepted),
        token_for(1, side),
        BytesMut::new(),
    );
    (endpoint, client)
}

fn bench_relay_pump(c: &mut Criterion) {
    const CHUNK: u64 = 256 * 1024;

    let (mut source, mut producer) = endpoint_pair(Side::Source);
    let (mut dest, mut consumer) = endpoint_pair(Side::Dest);

    thread::spawn(move || {
        let block = vec![0xA5u8; 64 * 1024];
        while producer.write_all(&block).is_ok() {}
    });
    thread::spawn(move || {
        let mut sink = vec![0u8; 64 * 1024];
        while matches!(consumer.read(&mut sink), Ok(n) if n > 0) {}
    });

    let mut half = HalfState::default();
    let mut scratch = vec![0u8; RELAY_BUFFER_SIZE];

    let mut group = c.benchmark_group("relay_pump");
    group.throughput(Throughput::Bytes(CHUNK));

    group.bench_function("loopback_256k", |b| {
        b.iter(|| {
            let mut moved = 0u64;
            while moved < CHUNK {
                moved += pump(&mut source, &mut dest, &mut half, &mut scratch).unwrap();
            }
            black_box(moved)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_greeting,
    bench_parse_request,
    bench_encode_reply,
    bench_relay_pump,
);
criterion_main!(benches);
