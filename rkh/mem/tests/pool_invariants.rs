//! Generated get/put and allocate/reserve/release sequences against the
//! pool and reference-count invariants.

use proptest::prelude::*;
use rkh_core::{Evt, PoolId, Signal};
use rkh_mem::{BlockHandle, EventPools, MemPool, PoolError, Release};

#[derive(Debug, Clone)]
enum BlockOp {
    Get,
    /// Return the held block picked by the index, modulo the held count
    Put(usize),
}

fn block_ops() -> impl Strategy<Value = Vec<BlockOp>> {
    prop::collection::vec(
        prop_oneof![Just(BlockOp::Get), any::<usize>().prop_map(BlockOp::Put)],
        1..400,
    )
}

#[derive(Debug, Clone)]
enum EventOp {
    Allocate { large: bool },
    Reserve(usize),
    Release(usize),
}

fn event_ops() -> impl Strategy<Value = Vec<EventOp>> {
    prop::collection::vec(
        prop_oneof![
            any::<bool>().prop_map(|large| EventOp::Allocate { large }),
            any::<usize>().prop_map(EventOp::Reserve),
            any::<usize>().prop_map(EventOp::Release),
        ],
        1..600,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn free_count_never_exceeds_total_and_blocks_are_unique(ops in block_ops()) {
        let pool = MemPool::with_blocks(6, 12).unwrap();
        let total = pool.total_blocks();
        let mut held: Vec<BlockHandle> = Vec::new();

        for op in ops {
            match op {
                BlockOp::Get => match pool.get() {
                    Some(handle) => {
                        prop_assert!((handle.index as usize) < total);
                        prop_assert!(
                            !held.iter().any(|h| h.index == handle.index),
                            "block handed out twice"
                        );
                        held.push(handle);
                    }
                    None => prop_assert_eq!(held.len(), total),
                },
                BlockOp::Put(pick) if !held.is_empty() => {
                    let handle = held.swap_remove(pick % held.len());
                    prop_assert_eq!(pool.put(handle), Ok(()));
                    prop_assert_eq!(
                        pool.put(handle),
                        Err(PoolError::DoubleFree { index: handle.index })
                    );
                }
                BlockOp::Put(_) => {}
            }
            let stats = pool.stats();
            prop_assert!(stats.free_blocks <= stats.total_blocks);
            prop_assert_eq!(stats.free_blocks + held.len(), total);
            prop_assert!(stats.min_free_blocks <= stats.free_blocks);
        }
    }

    #[test]
    fn each_event_is_reclaimed_exactly_once(ops in event_ops()) {
        let mut pools = EventPools::new();
        let small = pools.register_blocks(8, 8).unwrap();
        let large = pools.register_blocks(4, 64).unwrap();

        // live events and the references each one holds
        let mut refs: Vec<(Evt, u32)> = Vec::new();
        let mut reclaimed: Vec<Evt> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                EventOp::Allocate { large } => {
                    let size = if large { 40 } else { 4 };
                    if let Ok(evt) = pools.allocate(size, Signal::new(step as u16), None) {
                        // an event is only tracked once somebody holds it
                        pools.reserve(&evt).unwrap();
                        refs.push((evt, 1));
                    }
                }
                EventOp::Reserve(pick) if !refs.is_empty() => {
                    let index = pick % refs.len();
                    pools.reserve(&refs[index].0).unwrap();
                    refs[index].1 += 1;
                }
                EventOp::Release(pick) if !refs.is_empty() => {
                    let index = pick % refs.len();
                    let evt = refs[index].0;
                    refs[index].1 -= 1;
                    let left = refs[index].1;
                    match pools.release(&evt, None).unwrap() {
                        Release::Reclaimed => {
                            prop_assert_eq!(left, 0);
                            refs.swap_remove(index);
                            prop_assert!(!reclaimed.contains(&evt), "event reclaimed twice");
                            reclaimed.push(evt);
                        }
                        Release::Retained(n) => prop_assert_eq!(u32::from(n), left),
                        Release::Unowned => prop_assert!(false, "tracked event lost its holders"),
                    }
                }
                _ => {}
            }

            let live_small = refs.iter().filter(|(e, _)| e.pool_id() == small.get()).count();
            let live_large = refs.iter().filter(|(e, _)| e.pool_id() == large.get()).count();
            prop_assert_eq!(pools.stats(small).unwrap().used_blocks, live_small);
            prop_assert_eq!(pools.stats(large).unwrap().used_blocks, live_large);
        }

        for evt in reclaimed {
            prop_assert_eq!(
                pools.release(&evt, None),
                Err(PoolError::StaleHandle {
                    index: evt.block().unwrap().index
                })
            );
        }
    }
}

#[test]
fn unknown_pool_ids_are_reported() {
    let pools = EventPools::new();
    assert_eq!(
        pools.stats(PoolId::new(3).unwrap()),
        Err(PoolError::UnknownPool { pool: 3 })
    );
}
