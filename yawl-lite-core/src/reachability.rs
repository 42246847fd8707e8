//! Non-local OR-join decision.
//!
//! An OR-join task fires when waiting is futile: no continuation of the
//! current marking can put a token into a currently-empty preset condition.
//! The decision restricts the net to elements that both carry influence from
//! the current marking and can influence the join task, then saturates an
//! optimistic may-fire relation over that restricted net.

use crate::marking::{InternalPlace, Marking, Place};
use crate::spec::model::{NetElement, NetSpec, TaskSpec};
use crate::types::{ElementId, JoinCode};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Decide whether an OR-join task should fire under `marking`.
///
/// Edge policies: a join with zero preset tokens never fires; a join with
/// every preset condition marked always fires. Tasks carrying cancellation
/// regions are treated as possibly firing like any other — their purge runs
/// before postset production, so removal cannot veto a possible arrival.
pub fn or_join_enabled(net: &NetSpec, marking: &Marking, task: &TaskSpec) -> bool {
    let preset = net.preset(&task.id);

    let mut marked_preset: BTreeSet<&ElementId> = BTreeSet::new();
    let mut empty_preset: BTreeSet<&ElementId> = BTreeSet::new();
    for cond in preset {
        if marking.marked(&Place::Condition(cond.clone())) {
            marked_preset.insert(cond);
        } else {
            empty_preset.insert(cond);
        }
    }

    if marked_preset.is_empty() {
        return false;
    }
    if empty_preset.is_empty() {
        return true;
    }

    // Restrict the net to the marking, then to the join task.
    let seeds = seed_elements(net, marking);
    let forward = forward_closure(net, &seeds);
    let backward = backward_closure(net, &task.id);
    let restricted: BTreeSet<ElementId> = forward.intersection(&backward).cloned().collect();

    // Optimistic saturation: which restricted conditions may yet gain a
    // token, treating every enabled-or-busy task except the join itself as
    // willing to fire?
    let mut possibly: BTreeSet<ElementId> = restricted
        .iter()
        .filter(|id| {
            net.condition(id).is_some() && marking.marked(&Place::Condition((*id).clone()))
        })
        .cloned()
        .collect();
    let mut fired: BTreeSet<ElementId> = BTreeSet::new();

    // Busy tasks already hold instances; their completion produces postset
    // tokens regardless of further input.
    for t in net.tasks() {
        if t.id != task.id && restricted.contains(&t.id) && task_busy(marking, &t.id) {
            fired.insert(t.id.clone());
        }
    }

    loop {
        let mut changed = false;

        for t in net.tasks() {
            if t.id == task.id || !restricted.contains(&t.id) || fired.contains(&t.id) {
                continue;
            }
            if join_may_hold(net, t, &possibly) {
                fired.insert(t.id.clone());
                changed = true;
            }
        }

        for t_id in &fired {
            let Some(t) = net.task(t_id) else { continue };
            for flow in &t.flows {
                if restricted.contains(&flow.target) && possibly.insert(flow.target.clone()) {
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }

    // Waiting is futile iff no empty preset condition may still be marked.
    !empty_preset.iter().any(|q| possibly.contains(*q))
}

/// Optimistic join test: could `task` fire given the may-be-marked set?
/// OR-joins of other tasks are treated like XOR here (any input suffices) —
/// the optimistic direction for reachability.
fn join_may_hold(net: &NetSpec, task: &TaskSpec, possibly: &BTreeSet<ElementId>) -> bool {
    let preset = net.preset(&task.id);
    if preset.is_empty() {
        return false;
    }
    match task.join {
        JoinCode::And => preset.iter().all(|c| possibly.contains(c)),
        JoinCode::Or | JoinCode::Xor => preset.iter().any(|c| possibly.contains(c)),
    }
}

fn task_busy(marking: &Marking, task: &str) -> bool {
    [
        InternalPlace::Entered,
        InternalPlace::Active,
        InternalPlace::Executing,
        InternalPlace::Complete,
    ]
    .iter()
    .any(|p| marking.marked(&Place::Internal(task.to_string(), *p)))
}

/// Elements that currently hold influence: marked conditions plus tasks with
/// tokens in their internal places.
fn seed_elements(net: &NetSpec, marking: &Marking) -> BTreeSet<ElementId> {
    let mut seeds = BTreeSet::new();
    for cond in net.conditions() {
        if marking.marked(&Place::Condition(cond.id.clone())) {
            seeds.insert(cond.id.clone());
        }
    }
    for task in net.tasks() {
        if task_busy(marking, &task.id) {
            seeds.insert(task.id.clone());
        }
    }
    seeds
}

fn forward_closure(net: &NetSpec, seeds: &BTreeSet<ElementId>) -> BTreeSet<ElementId> {
    let mut seen: BTreeSet<ElementId> = seeds.clone();
    let mut queue: VecDeque<ElementId> = seeds.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        for next in successors(net, &id) {
            if seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn backward_closure(net: &NetSpec, target: &str) -> BTreeSet<ElementId> {
    // Predecessor adjacency, built once per call.
    let mut preds: HashMap<&str, Vec<&str>> = HashMap::new();
    for element in net.elements.values() {
        match element {
            NetElement::Condition(c) => {
                for t in &c.flows_to {
                    preds.entry(t.as_str()).or_default().push(c.id.as_str());
                }
            }
            NetElement::Task(t) => {
                for flow in &t.flows {
                    preds
                        .entry(flow.target.as_str())
                        .or_default()
                        .push(t.id.as_str());
                }
            }
        }
    }

    let mut seen: BTreeSet<ElementId> = BTreeSet::new();
    seen.insert(target.to_string());
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(target);
    while let Some(id) = queue.pop_front() {
        if let Some(ps) = preds.get(id) {
            for p in ps {
                if seen.insert(p.to_string()) {
                    queue.push_back(p);
                }
            }
        }
    }
    seen
}

fn successors<'a>(net: &'a NetSpec, id: &str) -> Vec<ElementId> {
    match net.element(id) {
        Some(NetElement::Condition(c)) => c.flows_to.clone(),
        Some(NetElement::Task(t)) => t.flows.iter().map(|f| f.target.clone()).collect(),
        None => Vec::new(),
    }
}

// ─── Memoisation ──────────────────────────────────────────────

/// Content-keyed memo for OR-join decisions. Keys are a digest of the case
/// marking plus the join task, so entries never go stale; the map is cleared
/// when it outgrows its cap.
#[derive(Debug, Default)]
pub struct OrJoinCache {
    memo: HashMap<(String, ElementId), bool>,
}

const CACHE_CAP: usize = 1024;

impl OrJoinCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(&mut self, net: &NetSpec, marking: &Marking, task: &TaskSpec) -> bool {
        let key = (marking_fingerprint(marking), task.id.clone());
        if let Some(&hit) = self.memo.get(&key) {
            return hit;
        }
        let decision = or_join_enabled(net, marking, task);
        if self.memo.len() >= CACHE_CAP {
            self.memo.clear();
        }
        self.memo.insert(key, decision);
        decision
    }
}

/// Stable digest of a marking: place/identifier pairs in sorted order.
pub fn marking_fingerprint(marking: &Marking) -> String {
    let mut hasher = Sha256::new();
    for (place, count) in marking.counts() {
        hasher.update(place.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(count.to_le_bytes());
        hasher.update([0xff]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marking::CaseMarking;
    use crate::spec::model::NetBuilder;
    use crate::types::{ExecutionProfile, SplitCode};

    /// `i → {A, B}` deferred choice, both feeding OR-join C.
    fn choice_net() -> NetSpec {
        NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(TaskSpec::atomic("A", ExecutionProfile::manual()).flow_to("C"))
            .task(TaskSpec::atomic("B", ExecutionProfile::manual()).flow_to("C"))
            .task(
                TaskSpec::atomic("C", ExecutionProfile::manual())
                    .join(JoinCode::Or)
                    .flow_to("o"),
            )
            .flow("i", "A")
            .flow("i", "B")
            .build()
    }

    /// True parallel: AND-split S into A and B, OR-join C.
    fn parallel_net() -> NetSpec {
        NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .condition("c1")
            .condition("c2")
            .task(
                TaskSpec::atomic("S", ExecutionProfile::manual())
                    .split(SplitCode::And)
                    .flow_to("c1")
                    .flow_to("c2"),
            )
            .task(TaskSpec::atomic("A", ExecutionProfile::manual()).flow_to("C"))
            .task(TaskSpec::atomic("B", ExecutionProfile::manual()).flow_to("C"))
            .task(
                TaskSpec::atomic("C", ExecutionProfile::manual())
                    .join(JoinCode::Or)
                    .flow_to("o"),
            )
            .flow("i", "S")
            .flow("c1", "A")
            .flow("c2", "B")
            .build()
    }

    #[test]
    fn fires_when_abandoned_branch_cannot_deliver() {
        let net = choice_net();
        let mut cm = CaseMarking::new(&"K".to_string());
        let root = cm.root().clone();
        // B already produced into its implicit output condition; A's branch
        // lost the deferred choice and holds nothing.
        cm.add_location(&root, &Place::condition("c{B_C}"));

        let c = net.task("C").unwrap();
        assert!(or_join_enabled(&net, cm.marking(), c));
    }

    #[test]
    fn waits_while_parallel_branch_is_live() {
        let net = parallel_net();
        let mut cm = CaseMarking::new(&"K".to_string());
        let root = cm.root().clone();
        // A finished; B's input condition still holds a token.
        cm.add_location(&root, &Place::condition("c{A_C}"));
        cm.add_location(&root, &Place::condition("c2"));

        let c = net.task("C").unwrap();
        assert!(!or_join_enabled(&net, cm.marking(), c));
    }

    #[test]
    fn waits_while_parallel_branch_task_is_busy() {
        let net = parallel_net();
        let mut cm = CaseMarking::new(&"K".to_string());
        let root = cm.root().clone();
        cm.add_location(&root, &Place::condition("c{A_C}"));
        // B consumed c2 and is executing.
        let child = cm.spawn_child(&root).unwrap();
        cm.add_location(&child, &Place::internal("B", InternalPlace::Executing));

        let c = net.task("C").unwrap();
        assert!(!or_join_enabled(&net, cm.marking(), c));
    }

    #[test]
    fn fires_once_all_branches_delivered() {
        let net = parallel_net();
        let mut cm = CaseMarking::new(&"K".to_string());
        let root = cm.root().clone();
        cm.add_location(&root, &Place::condition("c{A_C}"));
        cm.add_location(&root, &Place::condition("c{B_C}"));

        let c = net.task("C").unwrap();
        assert!(or_join_enabled(&net, cm.marking(), c));
    }

    #[test]
    fn zero_preset_tokens_never_fires() {
        let net = choice_net();
        let cm = CaseMarking::new(&"K".to_string());
        let c = net.task("C").unwrap();
        assert!(!or_join_enabled(&net, cm.marking(), c));
    }

    #[test]
    fn cache_reuses_decisions_per_marking() {
        let net = choice_net();
        let mut cm = CaseMarking::new(&"K".to_string());
        let root = cm.root().clone();
        cm.add_location(&root, &Place::condition("c{B_C}"));

        let mut cache = OrJoinCache::new();
        let c = net.task("C").unwrap();
        let first = cache.decide(&net, cm.marking(), c);
        let second = cache.decide(&net, cm.marking(), c);
        assert_eq!(first, second);
        assert!(first);

        // A different marking takes a different key.
        cm.add_location(&root, &Place::condition("i"));
        assert!(!cache.decide(&net, cm.marking(), c));
    }
}
