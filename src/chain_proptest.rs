#![cfg(test)]

// Property tests for Chain kept inside the crate so they can reach the
// crate-private node and pool types.

use crate::chain::{Chain, Link};
use crate::pool::{CountingPool, Pool, DEFAULT_POOL_TAG};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use slotmap::DefaultKey;

// Keys come from a small pool so duplicates and repeated removals are common.
#[derive(Clone, Debug)]
enum Op {
    Push(usize, i32),
    PushNoRoom(usize, i32),
    UnlinkFirst(usize),
    UnlinkStale(usize),
    Find(usize),
    Walk,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<u32>, Vec<Op>)> {
    proptest::collection::vec(any::<u32>(), 1..=6).prop_flat_map(|keys| {
        let idxs: Vec<usize> = (0..keys.len()).collect();
        let idx = proptest::sample::select(idxs);
        let op = prop_oneof![
            3 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Push(i, v)),
            1 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::PushNoRoom(i, v)),
            2 => idx.clone().prop_map(Op::UnlinkFirst),
            1 => (0usize..16).prop_map(Op::UnlinkStale),
            2 => idx.clone().prop_map(Op::Find),
            1 => Just(Op::Walk),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (keys.clone(), ops))
    })
}

// Property: state-machine equivalence against an ordered Vec model.
// - push_back appends; find/unlink act on the earliest matching node.
// - A push with no room in the arena hands its node back and changes nothing.
// - Forward and backward walks agree after every step.
// - Keys of unlinked nodes never resolve again.
// - Pool accounting: outstanding blocks == nodes in the chain.
// The chain is drained whatever the outcome so a failed assertion is
// reported as itself rather than as a leaked block.
proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]
    #[test]
    fn prop_chain_matches_model((keys, ops) in arb_scenario()) {
        let counting = CountingPool::new();
        let pool = Pool::new(&counting, DEFAULT_POOL_TAG);
        let mut sut: Chain<i32> = Chain::new();

        let outcome = (|| -> Result<(), TestCaseError> {
            let mut model: Vec<(DefaultKey, u32, i32)> = Vec::new();
            let mut stale: Vec<DefaultKey> = Vec::new();

            for op in ops {
                match op {
                    Op::Push(i, v) => {
                        let node = pool.alloc(Link::new(keys[i], v)).unwrap();
                        let k = sut.push_back(node).unwrap();
                        model.push((k, keys[i], v));
                    }
                    Op::PushNoRoom(i, v) => {
                        sut.set_slot_limit(Some(sut.len()));
                        let node = pool.alloc(Link::new(keys[i], v)).unwrap();
                        let res = sut.push_back(node);
                        sut.set_slot_limit(None);
                        match res {
                            Err(node) => prop_assert_eq!(pool.free(node).into_value(), v),
                            Ok(k) => prop_assert!(false, "push past the slot limit returned {:?}", k),
                        }
                    }
                    Op::UnlinkFirst(i) => {
                        let expected = model.iter().position(|&(_, key, _)| key == keys[i]);
                        match (sut.find(keys[i]), expected) {
                            (Some(k), Some(pos)) => {
                                let (mk, _, mv) = model.remove(pos);
                                prop_assert_eq!(k, mk);
                                let node = sut.unlink(k).unwrap();
                                prop_assert_eq!(pool.free(node).into_value(), mv);
                                stale.push(k);
                            }
                            (None, None) => {}
                            (got, want) => prop_assert!(false, "find {:?} vs model {:?}", got, want),
                        }
                    }
                    Op::UnlinkStale(i) => {
                        if let Some(&k) = stale.get(i) {
                            prop_assert!(sut.unlink(k).is_none());
                        }
                    }
                    Op::Find(i) => {
                        let want = model.iter().find(|&&(_, key, _)| key == keys[i]).map(|&(k, _, _)| k);
                        prop_assert_eq!(sut.find(keys[i]), want);
                    }
                    Op::Walk => {
                        let walked: Vec<(u32, i32)> = sut.iter().map(|(k, v)| (k, *v)).collect();
                        let expected: Vec<(u32, i32)> = model.iter().map(|&(_, k, v)| (k, v)).collect();
                        prop_assert_eq!(walked, expected);
                    }
                }

                sut.assert_consistent();
                prop_assert_eq!(sut.len(), model.len());
                prop_assert_eq!(counting.stats().outstanding(), model.len() as u64);
                for &k in &stale {
                    prop_assert!(sut.get_mut(k).is_none());
                }
            }
            Ok(())
        })();

        let nodes: Vec<_> = sut.drain().collect();
        for node in nodes {
            pool.free(node);
        }
        outcome?;
        prop_assert_eq!(counting.stats().outstanding(), 0);
    }
}
