use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::ControlFlow;

use proptest::prelude::*;

use crate::bn::{BasementNode, BASEMENT_FORMAT_VERSION};
use crate::dmt::Dmt;
use crate::error::Error;

fn bytecmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

fn dmt_contents(d: &Dmt) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    d.iterate_on_range(0, d.size(), |_, v| {
        out.push(v.to_vec());
        ControlFlow::Continue(())
    })
    .unwrap();
    out
}

fn bn_contents(bn: &BasementNode) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    bn.iterate_on_range(0, bn.num_klpairs(), |_, k, p| {
        out.push((k.to_vec(), p.to_vec()));
        ControlFlow::Continue(())
    })
    .unwrap();
    out
}

// =============================================================================
// Container vs. Vec model
// =============================================================================

#[derive(Clone, Debug)]
enum DmtOp {
    Insert(usize, Vec<u8>),
    Delete(usize),
    Fetch(usize),
    Prepare,
}

fn dmt_value_strategy() -> impl Strategy<Value = Vec<u8>> {
    // Mostly one fixed length so runs exercise the array representation
    // and the tree→array conversion; occasionally variable.
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 4..=4),
        1 => prop::collection::vec(any::<u8>(), 0..=9),
    ]
}

fn dmt_ops_strategy() -> impl Strategy<Value = Vec<DmtOp>> {
    let op = prop_oneof![
        5 => (any::<usize>(), dmt_value_strategy()).prop_map(|(i, v)| DmtOp::Insert(i, v)),
        3 => any::<usize>().prop_map(DmtOp::Delete),
        2 => any::<usize>().prop_map(DmtOp::Fetch),
        1 => Just(DmtOp::Prepare),
    ];
    prop::collection::vec(op, 0..=300)
}

// =============================================================================
// Basement node vs. BTreeMap model
// =============================================================================

#[derive(Clone, Debug)]
enum BnOp {
    Put(Vec<u8>, Vec<u8>),
    Remove(Vec<u8>),
    Get(Vec<u8>),
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> + Clone {
    // A tiny alphabet and short keys force collisions (overwrites,
    // deletes of existing keys) and mixed key lengths.
    prop::collection::vec(prop::sample::select(b"abcd".to_vec()), 1..=6)
}

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> + Clone {
    prop::collection::vec(any::<u8>(), 0..=16)
}

fn bn_ops_strategy() -> impl Strategy<Value = Vec<BnOp>> {
    let key = key_strategy();
    let op = prop_oneof![
        5 => (key.clone(), payload_strategy()).prop_map(|(k, v)| BnOp::Put(k, v)),
        3 => key.clone().prop_map(BnOp::Remove),
        2 => key.prop_map(BnOp::Get),
    ];
    prop::collection::vec(op, 0..=200)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_dmt_matches_vec_model(ops in dmt_ops_strategy()) {
        let mut d = Dmt::new();
        let mut model: Vec<Vec<u8>> = Vec::new();

        for op in ops {
            match op {
                DmtOp::Insert(sel, value) => {
                    let idx = (sel % (model.len() + 1)) as u32;
                    d.insert_at(&value, idx).unwrap();
                    model.insert(idx as usize, value);
                }
                DmtOp::Delete(sel) => {
                    if !model.is_empty() {
                        let idx = sel % model.len();
                        d.delete_at(idx as u32).unwrap();
                        model.remove(idx);
                    }
                }
                DmtOp::Fetch(sel) => {
                    if !model.is_empty() {
                        let idx = sel % model.len();
                        prop_assert_eq!(d.fetch(idx as u32).unwrap(), model[idx].as_slice());
                    }
                }
                DmtOp::Prepare => d.prepare_for_serialize(),
            }
            prop_assert_eq!(d.size() as usize, model.len());
            d.verify();
        }

        prop_assert_eq!(dmt_contents(&d), model);
    }

    #[test]
    fn prop_bn_matches_btreemap(ops in bn_ops_strategy()) {
        let mut bn = BasementNode::new();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                BnOp::Put(key, payload) => {
                    let found = match bn.find_zero(bytecmp, &key) {
                        Ok((idx, _, old)) => Ok((idx, old.len())),
                        Err(Error::NotFound { insert_index }) => Err(insert_index),
                        Err(e) => panic!("unexpected search failure: {e}"),
                    };
                    match found {
                        Ok((idx, old_len)) => {
                            bn.get_space_for_overwrite(idx, &key, old_len, payload.len())
                                .unwrap()
                                .copy_from_slice(&payload);
                        }
                        Err(insert_index) => {
                            bn.get_space_for_insert(insert_index, &key, payload.len())
                                .unwrap()
                                .copy_from_slice(&payload);
                        }
                    }
                    model.insert(key, payload);
                }
                BnOp::Remove(key) => {
                    let found = bn
                        .find_zero(bytecmp, &key)
                        .ok()
                        .map(|(idx, k, p)| (idx, k.len(), p.len()));
                    prop_assert_eq!(found.is_some(), model.contains_key(&key));
                    if let Some((idx, key_len, payload_len)) = found {
                        bn.delete_leafentry(idx, key_len, payload_len).unwrap();
                        model.remove(&key);
                    }
                }
                BnOp::Get(key) => {
                    let got = bn.find_zero(bytecmp, &key).ok().map(|(_, _, p)| p.to_vec());
                    prop_assert_eq!(got, model.get(&key).cloned());
                }
            }
            prop_assert_eq!(bn.num_klpairs() as usize, model.len());
            bn.verify();
        }

        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(bn_contents(&bn), expected.clone());

        // Snapshot clone is deep and identical.
        let cloned = bn.clone();
        cloned.verify();
        prop_assert_eq!(bn_contents(&cloned), expected.clone());

        // Serialized round trip reproduces the exact pair sequence.
        bn.prepare_to_serialize();
        let mut image = Vec::new();
        bn.serialize_header(&mut image);
        bn.serialize_rest(&mut image);
        let restored = BasementNode::deserialize_from_rbuf(
            bn.num_klpairs(),
            &image,
            image.len() as u32,
            BASEMENT_FORMAT_VERSION,
        )
        .unwrap();
        restored.verify();
        prop_assert_eq!(bn_contents(&restored), expected.clone());

        // Splitting at the midpoint conserves every entry.
        let mut dest = BasementNode::new();
        let split_at = bn.num_klpairs() / 2;
        bn.split_klpairs(&mut dest, split_at).unwrap();
        bn.verify();
        dest.verify();
        let mut joined = bn_contents(&bn);
        joined.extend(bn_contents(&dest));
        prop_assert_eq!(joined, expected);
    }
}

// =============================================================================
// Exhaustive small-set delete orders
// =============================================================================

fn for_each_permutation<T: Clone>(items: &[T], mut f: impl FnMut(Vec<T>)) {
    fn rec<T: Clone>(items: &[T], used: &mut [bool], out: &mut Vec<T>, f: &mut impl FnMut(Vec<T>)) {
        if out.len() == items.len() {
            f(out.clone());
            return;
        }
        for i in 0..items.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            out.push(items[i].clone());
            rec(items, used, out, f);
            out.pop();
            used[i] = false;
        }
    }

    let mut used = vec![false; items.len()];
    let mut out = Vec::with_capacity(items.len());
    rec(items, &mut used, &mut out, &mut f);
}

#[test]
fn exhaustive_delete_order_small_set() {
    // Build a 6-element tree, then delete the elements in every possible
    // order, mirroring against a Vec model at each step.
    let mut base = Dmt::new();
    let mut base_model: Vec<Vec<u8>> = Vec::new();
    for i in 0..6u32 {
        let value = i.to_be_bytes().to_vec();
        // Head inserts force the tree representation immediately.
        base.insert_at(&value, 0).unwrap();
        base_model.insert(0, value);
    }

    let ids: Vec<u32> = (0..6).collect();
    for_each_permutation(&ids, |perm| {
        let mut d = base.clone();
        let mut model = base_model.clone();
        for id in perm {
            let value = id.to_be_bytes().to_vec();
            let pos = model.iter().position(|v| *v == value).unwrap();
            d.delete_at(pos as u32).unwrap();
            model.remove(pos);
            d.verify();
            assert_eq!(dmt_contents(&d), model);
        }
        assert_eq!(d.size(), 0);
        assert!(d.is_array());
    });
}
