//! Identifiers and the per-case marking.
//!
//! The marking maps places (conditions and internal task places) to the
//! identifiers currently sitting there. Identifier location sets and the
//! place multisets are mutated only through `CaseMarking`, which keeps both
//! sides in sync as one atomic pair.

use crate::types::{CaseId, ElementId, IdentifierId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─── Places ───────────────────────────────────────────────────

/// The four internal conditions every task owns per invocation. Instance
/// identifiers migrate entered → active → executing → complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InternalPlace {
    Entered,
    Active,
    Executing,
    Complete,
}

/// A runtime marking key: a condition, or an internal place of a task.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Place {
    Condition(ElementId),
    Internal(ElementId, InternalPlace),
}

impl Place {
    pub fn condition(id: impl Into<String>) -> Self {
        Place::Condition(id.into())
    }

    pub fn internal(task: impl Into<String>, place: InternalPlace) -> Self {
        Place::Internal(task.into(), place)
    }

    /// The net element this place belongs to.
    pub fn element(&self) -> &ElementId {
        match self {
            Place::Condition(id) | Place::Internal(id, _) => id,
        }
    }
}

impl std::fmt::Display for Place {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Place::Condition(id) => f.write_str(id),
            Place::Internal(task, p) => write!(f, "{task}/{p:?}"),
        }
    }
}

// ─── Marking ──────────────────────────────────────────────────

/// Place → identifiers, in arrival order. Serialised as a pair list because
/// JSON maps cannot key on structured places.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "Vec<(Place, Vec<IdentifierId>)>",
    into = "Vec<(Place, Vec<IdentifierId>)>"
)]
pub struct Marking {
    places: BTreeMap<Place, Vec<IdentifierId>>,
}

impl From<Vec<(Place, Vec<IdentifierId>)>> for Marking {
    fn from(entries: Vec<(Place, Vec<IdentifierId>)>) -> Self {
        Self {
            places: entries.into_iter().collect(),
        }
    }
}

impl From<Marking> for Vec<(Place, Vec<IdentifierId>)> {
    fn from(marking: Marking) -> Self {
        marking.places.into_iter().collect()
    }
}

impl Marking {
    pub fn marked(&self, place: &Place) -> bool {
        self.places.get(place).is_some_and(|v| !v.is_empty())
    }

    pub fn count(&self, place: &Place) -> usize {
        self.places.get(place).map(Vec::len).unwrap_or(0)
    }

    pub fn idents(&self, place: &Place) -> &[IdentifierId] {
        self.places.get(place).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All places currently holding at least one identifier.
    pub fn marked_places(&self) -> impl Iterator<Item = &Place> {
        self.places
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(p, _)| p)
    }

    /// Read-only `place → count` view.
    pub fn counts(&self) -> BTreeMap<Place, usize> {
        self.places
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(p, v)| (p.clone(), v.len()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.places.values().all(Vec::is_empty)
    }

    fn add(&mut self, place: Place, ident: IdentifierId) {
        self.places.entry(place).or_default().push(ident);
    }

    fn remove(&mut self, place: &Place, ident: &IdentifierId) {
        if let Some(v) = self.places.get_mut(place) {
            if let Some(pos) = v.iter().position(|i| i == ident) {
                v.remove(pos);
            }
            if v.is_empty() {
                self.places.remove(place);
            }
        }
    }
}

// ─── Identifier tree ──────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct IdentNode {
    parent: Option<IdentifierId>,
    children: Vec<IdentifierId>,
    next_child: u32,
    locations: BTreeSet<Place>,
}

impl IdentNode {
    fn new(parent: Option<IdentifierId>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            next_child: 1,
            locations: BTreeSet::new(),
        }
    }
}

/// The identifier tree and the marking of one case, mutated in lockstep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseMarking {
    root: IdentifierId,
    nodes: BTreeMap<IdentifierId, IdentNode>,
    marking: Marking,
}

impl CaseMarking {
    pub fn new(case_id: &CaseId) -> Self {
        Self::with_root(IdentifierId::root(case_id))
    }

    /// Marking rooted at an arbitrary identifier — used for sub-net
    /// instances, whose root is a child identifier of the parent case.
    pub fn with_root(root: IdentifierId) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(root.clone(), IdentNode::new(None));
        Self {
            root,
            nodes,
            marking: Marking::default(),
        }
    }

    pub fn root(&self) -> &IdentifierId {
        &self.root
    }

    pub fn marking(&self) -> &Marking {
        &self.marking
    }

    pub fn contains(&self, ident: &IdentifierId) -> bool {
        self.nodes.contains_key(ident)
    }

    /// Spawn the next child of `parent` in creation order.
    pub fn spawn_child(&mut self, parent: &IdentifierId) -> Option<IdentifierId> {
        let node = self.nodes.get_mut(parent)?;
        let child = parent.child(node.next_child);
        node.next_child += 1;
        node.children.push(child.clone());
        self.nodes
            .insert(child.clone(), IdentNode::new(Some(parent.clone())));
        Some(child)
    }

    /// Children of an identifier, in stable creation order.
    pub fn children(&self, ident: &IdentifierId) -> &[IdentifierId] {
        self.nodes
            .get(ident)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Idempotent location add, kept in sync on both sides.
    pub fn add_location(&mut self, ident: &IdentifierId, place: &Place) {
        let Some(node) = self.nodes.get_mut(ident) else {
            return;
        };
        if node.locations.insert(place.clone()) {
            self.marking.add(place.clone(), ident.clone());
        }
    }

    /// Idempotent location removal, kept in sync on both sides.
    pub fn remove_location(&mut self, ident: &IdentifierId, place: &Place) {
        let Some(node) = self.nodes.get_mut(ident) else {
            return;
        };
        if node.locations.remove(place) {
            self.marking.remove(place, ident);
        }
    }

    /// Move an identifier between places as one step.
    pub fn move_location(&mut self, ident: &IdentifierId, from: &Place, to: &Place) {
        self.remove_location(ident, from);
        self.add_location(ident, to);
    }

    pub fn locations(&self, ident: &IdentifierId) -> impl Iterator<Item = &Place> {
        self.nodes
            .get(ident)
            .into_iter()
            .flat_map(|n| n.locations.iter())
    }

    /// Remove the first identifier found in a place (deferred-choice
    /// consumption order is arrival order).
    pub fn remove_one(&mut self, place: &Place) -> Option<IdentifierId> {
        let ident = self.marking.idents(place).first()?.clone();
        self.remove_location(&ident, place);
        Some(ident)
    }

    /// Purge every identifier from a place.
    pub fn remove_all(&mut self, place: &Place) {
        let idents: Vec<IdentifierId> = self.marking.idents(place).to_vec();
        for ident in idents {
            self.remove_location(&ident, place);
        }
    }

    /// Destroy an identifier subtree: vacate every location, drop the nodes,
    /// and detach from the parent's child list.
    pub fn destroy(&mut self, ident: &IdentifierId) {
        let mut stack = vec![ident.clone()];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.remove(&id) else {
                continue;
            };
            for place in &node.locations {
                self.marking.remove(place, &id);
            }
            stack.extend(node.children);
        }
        if let Some(parent) = ident.parent() {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| c != ident);
            }
        }
    }

    /// I1: every non-root identifier has an unbroken parent chain to the
    /// root. Used by consistency checks and tests.
    pub fn parent_chains_intact(&self) -> bool {
        self.nodes.iter().all(|(id, node)| match &node.parent {
            None => *id == self.root,
            Some(parent) => self.nodes.contains_key(parent),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case() -> CaseMarking {
        CaseMarking::new(&"K1".to_string())
    }

    #[test]
    fn add_remove_keeps_sides_in_sync() {
        let mut m = case();
        let root = m.root().clone();
        let p = Place::condition("c1");

        m.add_location(&root, &p);
        assert!(m.marking().marked(&p));
        assert_eq!(m.locations(&root).count(), 1);

        // Idempotent add does not duplicate.
        m.add_location(&root, &p);
        assert_eq!(m.marking().count(&p), 1);

        m.remove_location(&root, &p);
        assert!(!m.marking().marked(&p));
        assert_eq!(m.locations(&root).count(), 0);
    }

    #[test]
    fn children_created_in_order() {
        let mut m = case();
        let root = m.root().clone();
        let c1 = m.spawn_child(&root).unwrap();
        let c2 = m.spawn_child(&root).unwrap();
        let c3 = m.spawn_child(&root).unwrap();

        assert_eq!(c1.as_str(), "K1.1");
        assert_eq!(c2.as_str(), "K1.2");
        assert_eq!(c3.as_str(), "K1.3");
        assert_eq!(m.children(&root), &[c1.clone(), c2, c3]);
        assert_eq!(c1.parent(), Some(root));
        assert!(m.parent_chains_intact());
    }

    #[test]
    fn destroy_vacates_subtree() {
        let mut m = case();
        let root = m.root().clone();
        let child = m.spawn_child(&root).unwrap();
        let grandchild = m.spawn_child(&child).unwrap();

        let active = Place::internal("T", InternalPlace::Active);
        m.add_location(&child, &active);
        m.add_location(&grandchild, &active);
        assert_eq!(m.marking().count(&active), 2);

        m.destroy(&child);
        assert!(!m.contains(&child));
        assert!(!m.contains(&grandchild));
        assert!(!m.marking().marked(&active));
        assert_eq!(m.children(&root), &[] as &[IdentifierId]);
    }

    #[test]
    fn remove_one_takes_arrival_order() {
        let mut m = case();
        let root = m.root().clone();
        let a = m.spawn_child(&root).unwrap();
        let b = m.spawn_child(&root).unwrap();
        let p = Place::condition("c");

        m.add_location(&a, &p);
        m.add_location(&b, &p);

        assert_eq!(m.remove_one(&p), Some(a));
        assert_eq!(m.remove_one(&p), Some(b));
        assert_eq!(m.remove_one(&p), None);
    }

    #[test]
    fn marking_serialises_round_trip() {
        let mut m = case();
        let root = m.root().clone();
        m.add_location(&root, &Place::condition("c1"));
        m.add_location(&root, &Place::internal("T", InternalPlace::Executing));

        let json = serde_json::to_string(&m).unwrap();
        let back: CaseMarking = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
