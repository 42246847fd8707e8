//! Net model: the static structure of a specification.
//!
//! A specification owns one root net plus the sub-nets its composite tasks
//! decompose into. Each net is an arena of elements keyed by stable string
//! ids with adjacency stored as id lists, so the runtime marking can stay a
//! pure data structure over `(element id, identifier)` pairs.

use crate::data::{OutputMapping, OutputSchema, Predicate};
use crate::types::{ElementId, ExecutionProfile, JoinCode, MultiInstance, SplitCode, SpecId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ─── Conditions ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Sole token source at case start. Exactly one per net.
    Input,
    /// Reaching it terminates the net. Exactly one per net.
    Output,
    Plain,
    /// Materialised for a direct task→task flow at build time. Participates
    /// in the runtime marking but is omitted from canonical serialisation.
    Implicit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub id: ElementId,
    pub name: Option<String>,
    pub kind: ConditionKind,
    /// Tasks this condition feeds. More than one outgoing flow is a
    /// deferred choice: whichever task fires first consumes the token.
    pub flows_to: Vec<ElementId>,
}

// ─── Tasks ────────────────────────────────────────────────────

/// Outgoing flow of a task, ordered by priority for XOR evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub target: ElementId,
    pub predicate: Option<Predicate>,
    pub priority: u32,
    pub is_default: bool,
}

/// What an atomic or composite task decomposes into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Decomposition {
    /// Produces work items routed by the execution profile.
    Atomic {
        profile: ExecutionProfile,
        output_schema: OutputSchema,
        output_mappings: Vec<OutputMapping>,
    },
    /// Decomposes into a child instance of the named sub-net.
    Composite { subnet: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: ElementId,
    pub name: Option<String>,
    pub join: JoinCode,
    pub split: SplitCode,
    pub flows: Vec<FlowSpec>,
    /// Elements whose tokens are purged when this task exits.
    pub cancellation_region: BTreeSet<ElementId>,
    pub multi_instance: Option<MultiInstance>,
    pub decomposition: Decomposition,
    /// Task-level timer: work items of this task expire `timer_ms` after
    /// being enabled, taking the Failed completion path.
    pub timer_ms: Option<u64>,
}

impl TaskSpec {
    /// Atomic task with the YAWL default codes (XOR-join, AND-split).
    pub fn atomic(id: impl Into<String>, profile: ExecutionProfile) -> Self {
        Self {
            id: id.into(),
            name: None,
            join: JoinCode::Xor,
            split: SplitCode::And,
            flows: Vec::new(),
            cancellation_region: BTreeSet::new(),
            multi_instance: None,
            decomposition: Decomposition::Atomic {
                profile,
                output_schema: OutputSchema::default(),
                output_mappings: Vec::new(),
            },
            timer_ms: None,
        }
    }

    pub fn composite(id: impl Into<String>, subnet: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            join: JoinCode::Xor,
            split: SplitCode::And,
            flows: Vec::new(),
            cancellation_region: BTreeSet::new(),
            multi_instance: None,
            decomposition: Decomposition::Composite {
                subnet: subnet.into(),
            },
            timer_ms: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn join(mut self, join: JoinCode) -> Self {
        self.join = join;
        self
    }

    pub fn split(mut self, split: SplitCode) -> Self {
        self.split = split;
        self
    }

    /// Unconditional outgoing flow (next priority slot).
    pub fn flow_to(mut self, target: impl Into<String>) -> Self {
        let priority = self.flows.len() as u32;
        self.flows.push(FlowSpec {
            target: target.into(),
            predicate: None,
            priority,
            is_default: false,
        });
        self
    }

    /// Predicated outgoing flow (next priority slot).
    pub fn flow_if(mut self, target: impl Into<String>, predicate: Predicate) -> Self {
        let priority = self.flows.len() as u32;
        self.flows.push(FlowSpec {
            target: target.into(),
            predicate: Some(predicate),
            priority,
            is_default: false,
        });
        self
    }

    /// The default flow, taken when no predicate matches. OR/XOR splits must
    /// declare exactly one.
    pub fn default_flow(mut self, target: impl Into<String>) -> Self {
        let priority = self.flows.len() as u32;
        self.flows.push(FlowSpec {
            target: target.into(),
            predicate: None,
            priority,
            is_default: true,
        });
        self
    }

    pub fn cancels<I, S>(mut self, elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cancellation_region
            .extend(elements.into_iter().map(Into::into));
        self
    }

    pub fn multi_instance(mut self, mi: MultiInstance) -> Self {
        self.multi_instance = Some(mi);
        self
    }

    pub fn timer_ms(mut self, ms: u64) -> Self {
        self.timer_ms = Some(ms);
        self
    }

    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        if let Decomposition::Atomic { output_schema, .. } = &mut self.decomposition {
            *output_schema = schema;
        }
        self
    }

    pub fn output_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        if let Decomposition::Atomic {
            output_mappings, ..
        } = &mut self.decomposition
        {
            output_mappings.push(OutputMapping {
                from: from.into(),
                to: to.into(),
            });
        }
        self
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.decomposition, Decomposition::Composite { .. })
    }

    pub fn profile(&self) -> Option<&ExecutionProfile> {
        match &self.decomposition {
            Decomposition::Atomic { profile, .. } => Some(profile),
            Decomposition::Composite { .. } => None,
        }
    }
}

// ─── Net ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NetElement {
    Condition(ConditionSpec),
    Task(TaskSpec),
}

impl NetElement {
    pub fn id(&self) -> &str {
        match self {
            NetElement::Condition(c) => &c.id,
            NetElement::Task(t) => &t.id,
        }
    }
}

/// A finished net: element arena plus precomputed presets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetSpec {
    pub id: String,
    pub elements: BTreeMap<ElementId, NetElement>,
    /// task id → ordered preset condition ids.
    presets: BTreeMap<ElementId, Vec<ElementId>>,
    input: ElementId,
    output: ElementId,
}

impl NetSpec {
    pub fn input_condition(&self) -> &ElementId {
        &self.input
    }

    pub fn output_condition(&self) -> &ElementId {
        &self.output
    }

    pub fn element(&self, id: &str) -> Option<&NetElement> {
        self.elements.get(id)
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        match self.elements.get(id) {
            Some(NetElement::Task(t)) => Some(t),
            _ => None,
        }
    }

    pub fn condition(&self, id: &str) -> Option<&ConditionSpec> {
        match self.elements.get(id) {
            Some(NetElement::Condition(c)) => Some(c),
            _ => None,
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.elements.values().filter_map(|e| match e {
            NetElement::Task(t) => Some(t),
            _ => None,
        })
    }

    pub fn conditions(&self) -> impl Iterator<Item = &ConditionSpec> {
        self.elements.values().filter_map(|e| match e {
            NetElement::Condition(c) => Some(c),
            _ => None,
        })
    }

    /// Ordered preset condition ids of a task.
    pub fn preset(&self, task: &str) -> &[ElementId] {
        self.presets.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Postset condition ids of a task, in flow order.
    pub fn postset(&self, task: &str) -> Vec<ElementId> {
        self.task(task)
            .map(|t| t.flows.iter().map(|f| f.target.clone()).collect())
            .unwrap_or_default()
    }
}

// ─── Builder ──────────────────────────────────────────────────

/// Assembles a net. `build()` materialises an implicit condition for every
/// direct task→task flow and precomputes task presets.
pub struct NetBuilder {
    id: String,
    elements: BTreeMap<ElementId, NetElement>,
    input: Option<ElementId>,
    output: Option<ElementId>,
}

impl NetBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            elements: BTreeMap::new(),
            input: None,
            output: None,
        }
    }

    pub fn input_condition(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.input = Some(id.clone());
        self.elements.insert(
            id.clone(),
            NetElement::Condition(ConditionSpec {
                id,
                name: None,
                kind: ConditionKind::Input,
                flows_to: Vec::new(),
            }),
        );
        self
    }

    pub fn output_condition(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.output = Some(id.clone());
        self.elements.insert(
            id.clone(),
            NetElement::Condition(ConditionSpec {
                id,
                name: None,
                kind: ConditionKind::Output,
                flows_to: Vec::new(),
            }),
        );
        self
    }

    pub fn condition(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.elements.insert(
            id.clone(),
            NetElement::Condition(ConditionSpec {
                id,
                name: None,
                kind: ConditionKind::Plain,
                flows_to: Vec::new(),
            }),
        );
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.elements.insert(task.id.clone(), NetElement::Task(task));
        self
    }

    /// Condition→task flow.
    pub fn flow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let (from, to) = (from.into(), to.into());
        if let Some(NetElement::Condition(c)) = self.elements.get_mut(&from) {
            if !c.flows_to.contains(&to) {
                c.flows_to.push(to);
            }
        }
        self
    }

    pub fn build(mut self) -> NetSpec {
        self.materialise_implicit_conditions();

        let mut presets: BTreeMap<ElementId, Vec<ElementId>> = BTreeMap::new();
        for element in self.elements.values() {
            if let NetElement::Condition(c) = element {
                for task in &c.flows_to {
                    presets.entry(task.clone()).or_default().push(c.id.clone());
                }
            }
        }

        NetSpec {
            id: self.id,
            input: self.input.unwrap_or_default(),
            output: self.output.unwrap_or_default(),
            elements: self.elements,
            presets,
        }
    }

    /// Rewrite every task flow targeting another task through a fresh
    /// implicit condition `c{src}_{dst}`.
    fn materialise_implicit_conditions(&mut self) {
        let task_ids: BTreeSet<ElementId> = self
            .elements
            .values()
            .filter_map(|e| match e {
                NetElement::Task(t) => Some(t.id.clone()),
                _ => None,
            })
            .collect();

        let mut new_conditions: Vec<ConditionSpec> = Vec::new();
        for element in self.elements.values_mut() {
            let NetElement::Task(task) = element else {
                continue;
            };
            for flow in &mut task.flows {
                if task_ids.contains(&flow.target) {
                    let implicit_id = format!("c{{{}_{}}}", task.id, flow.target);
                    new_conditions.push(ConditionSpec {
                        id: implicit_id.clone(),
                        name: None,
                        kind: ConditionKind::Implicit,
                        flows_to: vec![flow.target.clone()],
                    });
                    flow.target = implicit_id;
                }
            }
        }
        for cond in new_conditions {
            self.elements
                .insert(cond.id.clone(), NetElement::Condition(cond));
        }
    }
}

// ─── Specification ────────────────────────────────────────────

/// A loaded specification: root net plus sub-nets for composite tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub id: SpecId,
    pub root_net: String,
    pub nets: BTreeMap<String, NetSpec>,
}

impl Specification {
    pub fn new(id: impl Into<String>, root: NetSpec) -> Self {
        let root_net = root.id.clone();
        let mut nets = BTreeMap::new();
        nets.insert(root.id.clone(), root);
        Self {
            id: id.into(),
            root_net,
            nets,
        }
    }

    pub fn with_subnet(mut self, net: NetSpec) -> Self {
        self.nets.insert(net.id.clone(), net);
        self
    }

    pub fn root(&self) -> &NetSpec {
        &self.nets[&self.root_net]
    }

    pub fn net(&self, id: &str) -> Option<&NetSpec> {
        self.nets.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_condition_materialised_for_task_to_task_flow() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(
                TaskSpec::atomic("A", ExecutionProfile::manual())
                    .flow_to("B"),
            )
            .task(TaskSpec::atomic("B", ExecutionProfile::manual()).flow_to("o"))
            .flow("i", "A")
            .build();

        let implicit = "c{A_B}";
        let cond = net.condition(implicit).expect("implicit condition exists");
        assert_eq!(cond.kind, ConditionKind::Implicit);
        assert_eq!(cond.flows_to, vec!["B".to_string()]);

        // A's flow was rewritten to the implicit condition.
        assert_eq!(net.postset("A"), vec![implicit.to_string()]);
        // B's preset is the implicit condition.
        assert_eq!(net.preset("B"), &[implicit.to_string()]);
    }

    #[test]
    fn presets_follow_condition_flows() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .condition("c1")
            .condition("c2")
            .task(
                TaskSpec::atomic("C", ExecutionProfile::manual())
                    .join(JoinCode::And)
                    .flow_to("o"),
            )
            .flow("c1", "C")
            .flow("c2", "C")
            .build();

        assert_eq!(
            net.preset("C"),
            &["c1".to_string(), "c2".to_string()]
        );
    }
}
