//! Dispatcher hot path: lookup, exit and entry over a three-level chart.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rkh_core::{Evt, Signal};
use rkh_sm::{Context, StateChart, StateMachine, Transition};
use std::sync::Arc;

const PING: Signal = Signal::new(1);
const PONG: Signal = Signal::new(2);
const TICK: Signal = Signal::new(3);

#[derive(Default)]
struct Counter {
    entries: u64,
    ticks: u64,
}

fn count_entry(ctx: &mut Context<'_, Counter>) {
    ctx.me.entries += 1;
}

fn count_tick(ctx: &mut Context<'_, Counter>) {
    ctx.me.ticks += 1;
}

/// A{A1{A11}}, B{B1{B11}}; PING and PONG cross between the two leaves
fn ping_pong() -> Arc<StateChart<Counter>> {
    let mut b = StateChart::<Counter>::builder("ping_pong");
    let a = b.composite("A", None);
    let a1 = b.composite("A1", Some(a));
    let a11 = b.basic("A11", Some(a1));
    let s_b = b.composite("B", None);
    let b1 = b.composite("B1", Some(s_b));
    let b11 = b.basic("B11", Some(b1));
    b.default_child(a, a1)
        .default_child(a1, a11)
        .default_child(s_b, b1)
        .default_child(b1, b11);
    for state in [a, a1, a11, s_b, b1, b11] {
        b.on_entry(state, count_entry);
    }
    b.transition(a11, Transition::to(PING, b11))
        .transition(s_b, Transition::to(PONG, a))
        .transition(a, Transition::internal(TICK).action(count_tick))
        .initial(a, None);
    match b.build() {
        Ok(chart) => Arc::new(chart),
        Err(e) => panic!("benchmark chart rejected: {e}"),
    }
}

fn bench_cross_hierarchy(c: &mut Criterion) {
    let chart = ping_pong();
    let mut sm = StateMachine::new(chart);
    let mut counter = Counter::default();
    sm.init(&mut counter).ok();
    let ping = Evt::new(PING);
    let pong = Evt::new(PONG);

    c.bench_function("dispatch_ping_pong", |b| {
        b.iter(|| {
            black_box(sm.dispatch(&mut counter, black_box(&ping))).ok();
            black_box(sm.dispatch(&mut counter, black_box(&pong))).ok();
        })
    });
}

fn bench_internal(c: &mut Criterion) {
    let chart = ping_pong();
    let mut sm = StateMachine::new(chart);
    let mut counter = Counter::default();
    sm.init(&mut counter).ok();
    let tick = Evt::new(TICK);

    c.bench_function("dispatch_internal_from_leaf", |b| {
        b.iter(|| black_box(sm.dispatch(&mut counter, black_box(&tick))))
    });
}

fn bench_unhandled(c: &mut Criterion) {
    let chart = ping_pong();
    let mut sm = StateMachine::new(chart);
    let mut counter = Counter::default();
    sm.init(&mut counter).ok();
    let unknown = Evt::new(Signal::new(99));

    c.bench_function("dispatch_event_not_found", |b| {
        b.iter(|| black_box(sm.dispatch(&mut counter, black_box(&unknown))))
    });
}

criterion_group!(benches, bench_cross_hierarchy, bench_internal, bench_unhandled);
criterion_main!(benches);
