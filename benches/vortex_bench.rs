//! Performance benchmarks for the simulation core.
//!
//! Run with: `cargo bench`
//! Or for a specific bench: `cargo bench --bench vortex_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tempest::component::ComponentRegistry;
use tempest::components;
use tempest::config::EngineConfigBuilder;
use tempest::event::{Activity, Event, EventId, Payload};
use tempest::graph::ConfigGraph;
use tempest::sim::Simulation;
use tempest::types::priority;
use tempest::vortex::TimeVortex;

fn make_event(seq: u64, time: u64) -> Activity {
    Activity::Event(Event {
        deliver_time: time,
        priority: priority::EVENT,
        order_tag: seq % 7,
        queue_order: seq,
        dest_link: 0,
        id: EventId { serial: seq, rank: 0 },
        payload: Payload::Null,
    })
}

fn bench_vortex(c: &mut Criterion) {
    let mut group = c.benchmark_group("vortex");
    for size in [1_000u64, 10_000, 100_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("insert_pop", size), &size, |b, &size| {
            b.iter(|| {
                let mut vortex = TimeVortex::new();
                // Scattered insertion order stresses the heap.
                for i in 0..size {
                    vortex.insert(make_event(i, (i * 2654435761) % size));
                }
                while let Some(a) = vortex.pop() {
                    black_box(a.time());
                }
            });
        });
    }
    group.finish();
}

fn bench_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_loop");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("serial_ping_pong_10k_events", |b| {
        b.iter(|| {
            let mut graph = ConfigGraph::new();
            let ping = graph.add_component("ping", "PingPong");
            let pong = graph.add_component("pong", "PingPong");
            graph.set_param(ping, "start", "true");
            graph.add_link(ping, "port", pong, "port", 1);

            let mut registry = ComponentRegistry::new();
            components::register_builtins(&mut registry);

            let config = EngineConfigBuilder::new()
                .stop_at("10000ps")
                .build()
                .unwrap();
            let report = Simulation::build(config, graph, registry)
                .unwrap()
                .run()
                .unwrap();
            black_box(report.events_delivered)
        });
    });
    group.finish();
}

criterion_group!(benches, bench_vortex, bench_ping_pong);
criterion_main!(benches);
