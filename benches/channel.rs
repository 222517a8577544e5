use std::time::Instant;

use criterion::{BenchmarkId, Criterion, Throughput};
use privas::channel::MsgChannel;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::runtime::Runtime;

pub fn channel_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(42);

    let mut g = c.benchmark_group("channel");
    for size_exp in [16, 20, 24] {
        let size = 2_usize.pow(size_exp);
        // half random, half zeros, so compression has something to do
        let mut payload = vec![0u8; size];
        rng.fill_bytes(&mut payload[..size / 2]);
        g.throughput(Throughput::Bytes(size as u64));
        g.bench_with_input(BenchmarkId::new("send+recv", size), &payload, |b, payload| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let (a, b) = tokio::io::duplex(1 << 16);
                let (mut tx, mut rx) = (MsgChannel(a), MsgChannel(b));
                let now = Instant::now();
                for _ in 0..iters {
                    let (sent, received) =
                        tokio::join!(tx.send(payload), rx.recv::<Vec<u8>>());
                    sent.expect("send failed");
                    assert_eq!(received.expect("recv failed").len(), payload.len());
                }
                now.elapsed()
            })
        });
    }
}
