//! Replica convergence under reordered and duplicated delivery.
//!
//! Three replicas mutate the same object independently, then every replica
//! receives every delta in its own shuffled order, each delta twice. All
//! replicas must end in the same state.

use axon_clock::{NodeId, Timestamp};
use proptest::prelude::*;

use crate::{CrdtObject, CrdtOp, CrdtType, Delta, Edge};

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Action {
    AddBelief(usize, u8),
    RemoveBelief(usize, u8),
    AddEdge(usize, u8, u8),
    Increment(usize, u8),
}

struct Replica {
    node: NodeId,
    object: CrdtObject,
    clock: u64,
    emitted: Vec<Delta>,
}

impl Replica {
    fn new(index: usize, crdt_type: CrdtType) -> Self {
        Self {
            node: NodeId::new(format!("r{index}")).unwrap(),
            object: CrdtObject::empty(crdt_type),
            clock: 0,
            emitted: Vec::new(),
        }
    }

    /// Stamp and apply a local op, mirroring what a worker does.
    fn local(&mut self, make: impl FnOnce(&CrdtObject, &NodeId, Timestamp) -> Option<CrdtOp>) {
        self.clock += 1;
        let hlc = Timestamp::new(self.clock, 0, self.node.clone());
        let Some(op) = make(&self.object, &self.node, hlc.clone()) else {
            return;
        };
        let delta = Delta {
            object_type: self.object.crdt_type(),
            object_id: "obj".into(),
            op,
            hlc,
            origin: self.node.clone(),
        };
        self.object.apply(&delta.op).unwrap();
        self.emitted.push(delta);
    }

    fn perform(&mut self, action: &Action) {
        match *action {
            Action::AddBelief(_, b) => self.local(|_, _, tag| {
                Some(CrdtOp::AddBelief {
                    belief: format!("b{b}"),
                    tag,
                })
            }),
            Action::RemoveBelief(_, b) => self.local(|object, _, _| {
                let belief = format!("b{b}");
                let tags = object.as_belief_set()?.live_tags(&belief);
                (!tags.is_empty()).then_some(CrdtOp::RemoveBelief { belief, tags })
            }),
            Action::AddEdge(_, s, o) => self.local(|_, _, _| {
                Some(CrdtOp::AddEdge {
                    edge: Edge::new(format!("n{s}"), "rel", format!("n{o}")),
                })
            }),
            Action::Increment(_, by) => self.local(|object, node, _| {
                let current = object.as_metric_counter()?.slot(node);
                Some(CrdtOp::CounterSlot {
                    node: node.clone(),
                    value: current + u64::from(by) + 1,
                })
            }),
        }
    }
}

fn replica_of(action: &Action) -> usize {
    match *action {
        Action::AddBelief(r, _)
        | Action::RemoveBelief(r, _)
        | Action::AddEdge(r, _, _)
        | Action::Increment(r, _) => r,
    }
}

/// Run `actions`, then cross-deliver every delta in a per-replica order
/// derived from `keys`, twice over.
fn converge(crdt_type: CrdtType, actions: &[Action], keys: &[u64]) -> Vec<CrdtObject> {
    let mut replicas: Vec<Replica> = (0..REPLICAS).map(|i| Replica::new(i, crdt_type)).collect();
    for action in actions {
        replicas[replica_of(action)].perform(action);
    }

    let all: Vec<Delta> = replicas.iter().flat_map(|r| r.emitted.clone()).collect();
    for (index, replica) in replicas.iter_mut().enumerate() {
        let mut order: Vec<(u64, usize)> = (0..all.len() * 2)
            .map(|i| (keys[(i + index * 7) % keys.len()], i % all.len().max(1)))
            .collect();
        order.sort();
        for (_, i) in order {
            if let Some(delta) = all.get(i) {
                replica.object.apply(&delta.op).unwrap();
            }
        }
    }
    replicas.into_iter().map(|r| r.object).collect()
}

fn belief_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0..REPLICAS, 0u8..5).prop_map(|(r, b)| Action::AddBelief(r, b)),
        2 => (0..REPLICAS, 0u8..5).prop_map(|(r, b)| Action::RemoveBelief(r, b)),
    ]
}

fn edge_action() -> impl Strategy<Value = Action> {
    (0..REPLICAS, 0u8..4, 0u8..4).prop_map(|(r, s, o)| Action::AddEdge(r, s, o))
}

fn counter_action() -> impl Strategy<Value = Action> {
    (0..REPLICAS, 0u8..10).prop_map(|(r, by)| Action::Increment(r, by))
}

fn keys() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(any::<u64>(), 1..64)
}

fn all_equal(objects: &[CrdtObject]) -> bool {
    objects.windows(2).all(|w| w[0] == w[1])
}

proptest! {
    #[test]
    fn belief_sets_converge(actions in prop::collection::vec(belief_action(), 0..40), keys in keys()) {
        let objects = converge(CrdtType::BeliefSet, &actions, &keys);
        prop_assert!(all_equal(&objects));
    }

    #[test]
    fn context_graphs_converge(actions in prop::collection::vec(edge_action(), 0..40), keys in keys()) {
        let objects = converge(CrdtType::ContextGraph, &actions, &keys);
        prop_assert!(all_equal(&objects));
        let distinct: std::collections::BTreeSet<(u8, u8)> = actions
            .iter()
            .filter_map(|a| match *a { Action::AddEdge(_, s, o) => Some((s, o)), _ => None })
            .collect();
        prop_assert_eq!(objects[0].as_context_graph().unwrap().len(), distinct.len());
    }

    #[test]
    fn counters_converge_to_the_sum_of_increments(
        actions in prop::collection::vec(counter_action(), 0..40),
        keys in keys(),
    ) {
        let objects = converge(CrdtType::MetricCounter, &actions, &keys);
        prop_assert!(all_equal(&objects));
        let expected: u64 = actions
            .iter()
            .map(|a| match *a { Action::Increment(_, by) => u64::from(by) + 1, _ => 0 })
            .sum();
        prop_assert_eq!(objects[0].as_metric_counter().unwrap().value(), expected);
    }
}

#[test]
fn unobserved_add_survives_concurrent_remove() {
    let actions = [
        Action::AddBelief(0, 1),
        Action::AddBelief(1, 1),
        Action::RemoveBelief(0, 1),
    ];
    let objects = converge(CrdtType::BeliefSet, &actions, &[3, 1, 4, 1, 5, 9, 2, 6]);
    assert!(all_equal(&objects));
    assert!(objects[0].as_belief_set().unwrap().contains("b1"));
}
