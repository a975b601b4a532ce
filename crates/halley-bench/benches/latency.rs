//! Latency benchmarks for Halley.
//!
//! These benchmarks focus on the per-message costs on the publish path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use halley_bench::{server, subscribers};
use halley_core::Route;
use serde_json::json;
use std::time::Instant;

/// Benchmark route parsing.
fn bench_route_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_parse");

    group.bench_function("short", |b| b.iter(|| Route::parse(black_box("/chat"))));
    group.bench_function("deep", |b| {
        b.iter(|| Route::parse(black_box("/org/team/project/stream/events")))
    });
    group.bench_function("wildcard", |b| {
        b.iter(|| Route::parse(black_box("/org/team/**")))
    });

    group.finish();
}

/// Benchmark wildcard matching.
fn bench_route_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_match");

    let concrete = Route::parse("/org/team/project/stream/events").unwrap();
    let wild = Route::parse("/org/team/project/stream/*").unwrap();
    let deep = Route::parse("/org/**").unwrap();
    let miss = Route::parse("/other/*").unwrap();

    group.bench_function("wild", |b| b.iter(|| wild.matches(black_box(&concrete))));
    group.bench_function("deep_wild", |b| b.iter(|| deep.matches(black_box(&concrete))));
    group.bench_function("miss", |b| b.iter(|| miss.matches(black_box(&concrete))));

    group.finish();
}

/// Benchmark publish followed by the subscriber draining its queue.
fn bench_publish_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_latency");

    group.bench_function("single_subscriber", |b| {
        b.iter_custom(|iters| {
            let server = server().unwrap();
            let sessions = subscribers(&server, "/chat/room", 1).unwrap();

            let start = Instant::now();
            for i in 0..iters {
                let _ = server.publish(None, "/chat/room", json!(i));
                black_box(sessions[0].drain());
            }
            start.elapsed()
        });
    });

    group.bench_function("ten_subscribers", |b| {
        b.iter_custom(|iters| {
            let server = server().unwrap();
            let sessions = subscribers(&server, "/chat/room", 10).unwrap();

            let start = Instant::now();
            for i in 0..iters {
                let _ = server.publish(None, "/chat/room", json!(i));
                for session in &sessions {
                    black_box(session.drain());
                }
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark channel lookup against a populated registry.
fn bench_channel_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_lookup");

    // Setup: 1000 channels with 10 subscribers each
    let server = server().unwrap();
    for i in 0..1000 {
        let _ = subscribers(&server, &format!("/channel/{i}"), 10).unwrap();
    }
    let route = Route::parse("/channel/500").unwrap();

    group.bench_function("find", |b| {
        let mut i = 0;
        b.iter(|| {
            let path = format!("/channel/{}", i % 1000);
            i += 1;
            server.find_channel(black_box(&path))
        });
    });

    group.bench_function("matching_wildcards", |b| {
        b.iter(|| server.channels().matching_wildcards(black_box(&route)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_route_parse,
    bench_route_match,
    bench_publish_latency,
    bench_channel_lookup,
);
criterion_main!(benches);
