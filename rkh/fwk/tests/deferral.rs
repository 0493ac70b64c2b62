//! A server that defers requests while busy and recalls them when done.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use rkh_fwk::{Active, Evt, Framework, FrameworkConfig, PoolId, Priority, Queue, Signal, Sma};
use rkh_sm::{Context, StateChart, Transition};

const REQUEST: Signal = Signal::new(10);
const DONE: Signal = Signal::new(11);
const SERVER: Priority = Priority::new_unchecked(3);

static FW: OnceCell<Framework> = OnceCell::new();

struct Server {
    deferred: Queue<Evt>,
    served: Vec<u8>,
}

fn fw() -> &'static Framework {
    FW.get_or_init(|| {
        let mut fw = Framework::new(FrameworkConfig::builder().name("deferral").build()).unwrap();
        fw.register_pool_blocks(8, 8).unwrap();
        fw
    })
}

fn serve(ctx: &mut Context<'_, Server>) {
    let id = fw().with_payload(ctx.event, |p| p[0]).unwrap();
    ctx.me.served.push(id);
}

fn defer(ctx: &mut Context<'_, Server>) {
    fw().defer(&ctx.me.deferred, ctx.event).unwrap();
}

fn recall(ctx: &mut Context<'_, Server>) {
    fw().recall(SERVER, &ctx.me.deferred).unwrap();
}

#[test]
fn busy_server_defers_and_recalls_requests() {
    let mut b = StateChart::<Server>::builder("server");
    let idle = b.basic("idle", None);
    let busy = b.basic("busy", None);
    b.transition(idle, Transition::to(REQUEST, busy).action(serve));
    b.transition(busy, Transition::internal(REQUEST).action(defer));
    b.transition(busy, Transition::to(DONE, idle).action(recall));
    b.initial(idle, None);
    let chart = Arc::new(b.build().unwrap());

    let server = Server {
        deferred: Queue::new(4).unwrap(),
        served: Vec::new(),
    };
    let sma = Sma::new("server", SERVER, chart, server, 8).unwrap();
    let fw = fw();
    fw.activate(sma.clone()).unwrap();

    for id in 1..=3u8 {
        let req = fw.allocate_with(REQUEST, &[id], None).unwrap();
        fw.post_fifo(SERVER, &req, None).unwrap();
    }
    for _ in 0..3 {
        fw.post_fifo(SERVER, &Evt::new(DONE), None).unwrap();
    }

    // three requests, three completions and two recalled requests
    assert_eq!(fw.run_until_idle().unwrap(), 8);
    assert_eq!(sma.with_data(|s| s.served.clone()), [1, 2, 3]);
    assert_eq!(sma.state_name(), Some("idle"));
    assert!(sma.with_data(|s| s.deferred.is_empty()));
    let stats = fw.pool_stats(PoolId::new(1).unwrap()).unwrap();
    assert_eq!(stats.used_blocks, 0);
    assert_eq!(stats.min_free_blocks, 5);
}
