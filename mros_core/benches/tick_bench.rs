//! Per-tick pipeline benchmarks
//!
//! Measures one full tick (expire, deliver, arbitrate, dispatch, collect)
//! over a bus holding a varying number of messages.
//!
//! Run with: cargo bench --bench tick_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mros_core::prelude::*;
use mros_core::time::ManualTime;
use mros_core::Arbitrator;
use std::sync::Arc;

/// Bus populations to test
const BUS_SIZES: &[usize] = &[8, 64, 256];

const EVENTS: &[Event] = &[
    Event::BumperPort,
    Event::InfraredCntr,
    Event::RemoteForward,
    Event::Velocity,
    Event::Roam,
    Event::Tick,
];

struct Sink;

impl Subscriber for Sink {
    fn name(&self) -> &str {
        "sink"
    }

    fn interests(&self) -> EventSet {
        EventSet::all()
    }

    fn on_message(&mut self, _message: &Message) -> Acknowledgement {
        Acknowledgement::Consumed
    }
}

struct Noop;

impl Behaviour for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    fn execute(&mut self, message: &Message) -> MrosResult<()> {
        black_box(message.payload());
        Ok(())
    }
}

fn populate(bus: &MessageBus, count: usize) {
    for i in 0..count {
        bus.publish(EVENTS[i % EVENTS.len()], Payload::Int(i as i64))
            .unwrap();
    }
}

/// Full tick: every message is consumed and collected within the tick
fn bench_full_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_tick");

    for &size in BUS_SIZES {
        group.bench_with_input(BenchmarkId::new("messages", size), &size, |b, &size| {
            let config = MrosConfig {
                bus_capacity: size,
                ..MrosConfig::standard()
            };
            let time = Arc::new(ManualTime::new(0));
            let bus = MessageBus::from_config(&config).with_time_source(time);
            let mut scheduler = Scheduler::new(config, bus).unwrap();
            scheduler.add_subscriber(Box::new(Sink)).unwrap();
            scheduler.add_behaviour(Box::new(Noop), EVENTS);

            b.iter(|| {
                populate(scheduler.bus(), size);
                black_box(scheduler.tick().unwrap());
            });
        });
    }

    group.finish();
}

/// Arbitration alone over a fixed snapshot
fn bench_arbitration(c: &mut Criterion) {
    let mut group = c.benchmark_group("arbitration");

    for &size in BUS_SIZES {
        let bus = MessageBus::new(size, 1_000).with_time_source(Arc::new(ManualTime::new(0)));
        populate(&bus, size);
        let snapshot = bus.snapshot();
        let arbitrator = Arbitrator::new(1_000);

        group.bench_with_input(BenchmarkId::new("select", size), &snapshot, |b, snapshot| {
            b.iter(|| black_box(arbitrator.select(black_box(snapshot), 0)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_full_tick, bench_arbitration);
criterion_main!(benches);
