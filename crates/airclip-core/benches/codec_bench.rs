//! Criterion benchmarks for the AirClip wire formats.
//!
//! Covers the discovery envelope (presence JSON inside the 8-byte header) and
//! the transfer frame codec at a few payload sizes.
//!
//! Run with:
//! ```bash
//! cargo bench --package airclip-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use airclip_core::protocol::envelope::{decode_envelope, encode_envelope, ProtocolId, ProtocolRegistry};
use airclip_core::protocol::frame::{decode_frame, encode_frame};
use airclip_core::protocol::messages::{Hello, Message, PresenceRecord, TransferFrame};
use airclip_core::EndPoint;
use uuid::Uuid;

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn make_presence() -> Vec<u8> {
    let record = PresenceRecord::online(EndPoint::local("henry", "windows").with_transfer_port(9457));
    record.to_json().expect("presence json")
}

fn make_text(len: usize) -> TransferFrame {
    TransferFrame::Message(Message::stamped("henry-windows", "x".repeat(len)))
}

fn make_hello() -> TransferFrame {
    TransferFrame::Hello(Hello {
        endpoint: EndPoint::local("henry", "windows"),
        node_id: Uuid::new_v4(),
    })
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_envelope(c: &mut Criterion) {
    let payload = make_presence();
    let bytes = encode_envelope(ProtocolId::PRESENCE, &payload);
    let registry = ProtocolRegistry::new().with(ProtocolId::PRESENCE);

    let mut group = c.benchmark_group("envelope");
    group.bench_function("encode_presence", |b| {
        b.iter(|| encode_envelope(black_box(ProtocolId::PRESENCE), black_box(&payload)))
    });
    group.bench_function("decode_presence", |b| {
        b.iter(|| decode_envelope(black_box(&bytes)).expect("decode must succeed"))
    });
    group.bench_function("parse_and_deserialize", |b| {
        b.iter(|| {
            let env = registry.parse(black_box(&bytes)).expect("parse must succeed");
            PresenceRecord::from_json(&env.payload).expect("json must parse")
        })
    });
    group.finish();
}

fn bench_frame(c: &mut Criterion) {
    let frames: &[(&str, TransferFrame)] = &[
        ("Hello", make_hello()),
        ("Text(64)", make_text(64)),
        ("Text(4096)", make_text(4096)),
        ("Text(65536)", make_text(65536)),
    ];

    let mut group = c.benchmark_group("frame");
    for (name, frame) in frames {
        group.bench_with_input(BenchmarkId::new("encode", name), frame, |b, frame| {
            b.iter(|| encode_frame(black_box(frame)).expect("encode must succeed"))
        });

        let bytes = encode_frame(frame).expect("encode must succeed");
        group.bench_with_input(BenchmarkId::new("decode", name), &bytes, |b, bytes| {
            b.iter(|| decode_frame(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_envelope, bench_frame);
criterion_main!(benches);
