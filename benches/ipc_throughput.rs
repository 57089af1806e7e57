//! IPC throughput benchmark.
//!
//! Measures frame encode/decode cost for typical payload sizes and the
//! request/response round trip through a dispatcher and an in-process worker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use modelserve::ipc::codec::{read_frame, write_frame};
use modelserve::ipc::{Channel, Message, Payload, PipePaths, RequestDispatcher};
use modelserve::types::{CorrelationId, IpcConfig};
use modelserve::worker::{HandlerTable, WorkerRuntime};
use serde_json::Value;
use std::io::Cursor;
use std::time::Duration;

const MAX_FRAME: u32 = 16 * 1024 * 1024;
const PAYLOAD_SIZES: &[usize] = &[0, 64, 1024, 4096, 65536];

fn payload_of(size: usize) -> Payload {
    let mut payload = Payload::new();
    payload.insert("data".to_string(), Value::String("x".repeat(size)));
    payload
}

fn bench_encode_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("encode_frame");
    for &size in PAYLOAD_SIZES {
        let msg = Message::request(CorrelationId::new(1), "echo", payload_of(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, m| {
            b.iter(|| {
                rt.block_on(async {
                    let body = black_box(m).encode().unwrap();
                    let mut buf = Vec::with_capacity(body.len() + 4);
                    write_frame(&mut buf, &body).await.unwrap();
                    buf
                })
            });
        });
    }
    group.finish();
}

fn bench_decode_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("decode_frame");
    for &size in PAYLOAD_SIZES {
        let msg = Message::response(CorrelationId::new(1), payload_of(size));
        let wire = rt.block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, &msg.encode().unwrap()).await.unwrap();
            buf
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    let body = read_frame(&mut cursor, MAX_FRAME).await.unwrap().unwrap();
                    Message::decode(&body).unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_dispatch_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ipc = IpcConfig::default();

    let dispatcher = rt.block_on(async {
        let (req_w, req_r) = tokio::io::duplex(1024 * 1024);
        let (resp_w, resp_r) = tokio::io::duplex(1024 * 1024);
        let mut manager = Channel::from_streams(resp_r, req_w, &ipc);
        let worker = Channel::from_streams(req_r, resp_w, &ipc);

        let table = HandlerTable::builder()
            .handler("echo", |p| async move { Ok(p) })
            .build()
            .unwrap();
        let runtime = WorkerRuntime::new(
            table,
            PipePaths::in_dir(std::path::Path::new("/unused")),
            ipc.clone(),
        );
        tokio::spawn(runtime.serve(worker, || async { Ok(()) }));

        manager.receive().await.unwrap();
        RequestDispatcher::start(manager)
    });

    let payload = payload_of(1024);
    c.bench_function("dispatch_round_trip_1kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                dispatcher
                    .call("echo", black_box(payload.clone()), Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        });
    });
}

criterion_group!(
    benches,
    bench_encode_frame,
    bench_decode_frame,
    bench_dispatch_round_trip
);
criterion_main!(benches);
