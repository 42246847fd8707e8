//! Structural verification, run at specification load before any case may
//! be launched. Errors reject the load; warnings are returned to the caller.

use super::model::{ConditionKind, Decomposition, NetElement, NetSpec, Specification};
use crate::error::EngineError;
use crate::types::{ElementId, SplitCode};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Verification finding. Also used for non-fatal warnings.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifyError {
    pub message: String,
    pub element_id: Option<ElementId>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.element_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct VerifyReport {
    pub errors: Vec<VerifyError>,
    pub warnings: Vec<VerifyError>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verify a whole specification. `known_handlers` holds the service refs
/// currently registered; unresolved refs are warnings, not errors.
pub fn verify(spec: &Specification, known_handlers: &BTreeSet<String>) -> VerifyReport {
    let mut report = VerifyReport::default();

    if spec.net(&spec.root_net).is_none() {
        report.errors.push(VerifyError {
            message: format!("root net `{}` is missing", spec.root_net),
            element_id: None,
        });
        return report;
    }

    for net in spec.nets.values() {
        verify_net(spec, net, known_handlers, &mut report);
    }
    report
}

/// Convenience wrapper: reject on errors, return the warnings.
pub fn verify_or_err(
    spec: &Specification,
    known_handlers: &BTreeSet<String>,
) -> Result<Vec<VerifyError>, EngineError> {
    let report = verify(spec, known_handlers);
    if report.is_ok() {
        Ok(report.warnings)
    } else {
        Err(EngineError::Structural(report.errors))
    }
}

fn verify_net(
    spec: &Specification,
    net: &NetSpec,
    known_handlers: &BTreeSet<String>,
    report: &mut VerifyReport,
) {
    // 1. Exactly one input and one output condition.
    let inputs: Vec<_> = net
        .conditions()
        .filter(|c| c.kind == ConditionKind::Input)
        .collect();
    let outputs: Vec<_> = net
        .conditions()
        .filter(|c| c.kind == ConditionKind::Output)
        .collect();

    if inputs.len() != 1 {
        report.errors.push(VerifyError {
            message: format!(
                "net `{}` must have exactly one input condition, found {}",
                net.id,
                inputs.len()
            ),
            element_id: None,
        });
    }
    if outputs.len() != 1 {
        report.errors.push(VerifyError {
            message: format!(
                "net `{}` must have exactly one output condition, found {}",
                net.id,
                outputs.len()
            ),
            element_id: None,
        });
    }

    // 2. Every flow endpoint resolves, with the right element polarity.
    for cond in net.conditions() {
        for target in &cond.flows_to {
            if net.task(target).is_none() {
                report.errors.push(VerifyError {
                    message: format!("flow target `{target}` is not a task of net `{}`", net.id),
                    element_id: Some(cond.id.clone()),
                });
            }
        }
        if cond.kind == ConditionKind::Output && !cond.flows_to.is_empty() {
            report.errors.push(VerifyError {
                message: "output condition must have no outgoing flows".to_string(),
                element_id: Some(cond.id.clone()),
            });
        }
    }
    for task in net.tasks() {
        for flow in &task.flows {
            if net.condition(&flow.target).is_none() {
                report.errors.push(VerifyError {
                    message: format!(
                        "flow target `{}` is not a condition of net `{}`",
                        flow.target, net.id
                    ),
                    element_id: Some(task.id.clone()),
                });
            }
        }
        if task.flows.is_empty() {
            report.errors.push(VerifyError {
                message: "task has no outgoing flow".to_string(),
                element_id: Some(task.id.clone()),
            });
        }
    }

    // 3. Reachability from input, co-reachability to output.
    if inputs.len() == 1 && outputs.len() == 1 {
        reachability(net, report);
    }

    // 4. OR/XOR splits: exactly one default flow, predicates elsewhere.
    for task in net.tasks() {
        if matches!(task.split, SplitCode::Or | SplitCode::Xor) && task.flows.len() > 1 {
            let defaults = task.flows.iter().filter(|f| f.is_default).count();
            if defaults != 1 {
                report.errors.push(VerifyError {
                    message: format!(
                        "{:?}-split must have exactly one default flow, found {defaults}",
                        task.split
                    ),
                    element_id: Some(task.id.clone()),
                });
            }
            for flow in task.flows.iter().filter(|f| !f.is_default) {
                if flow.predicate.is_none() {
                    report.errors.push(VerifyError {
                        message: format!(
                            "non-default flow to `{}` of a {:?}-split needs a predicate",
                            flow.target, task.split
                        ),
                        element_id: Some(task.id.clone()),
                    });
                }
            }
        }
    }

    // 5. Cancellation regions reference only elements of this net.
    for task in net.tasks() {
        for element in &task.cancellation_region {
            if net.element(element).is_none() {
                report.errors.push(VerifyError {
                    message: format!(
                        "cancellation region references `{element}`, not an element of net `{}`",
                        net.id
                    ),
                    element_id: Some(task.id.clone()),
                });
            }
        }
    }

    // 6. Multi-instance bounds.
    for task in net.tasks() {
        if let Some(mi) = &task.multi_instance {
            if mi.min < 1 || mi.min > mi.threshold || mi.threshold > mi.max {
                report.errors.push(VerifyError {
                    message: format!(
                        "multi-instance bounds must satisfy 1 ≤ min ≤ threshold ≤ max, \
                         got min={} threshold={} max={}",
                        mi.min, mi.threshold, mi.max
                    ),
                    element_id: Some(task.id.clone()),
                });
            }
        }
    }

    // 7. Decompositions: composite sub-nets exist; profile routing sanity.
    for task in net.tasks() {
        match &task.decomposition {
            Decomposition::Composite { subnet } => {
                if spec.net(subnet).is_none() {
                    report.errors.push(VerifyError {
                        message: format!("composite task decomposes into unknown net `{subnet}`"),
                        element_id: Some(task.id.clone()),
                    });
                }
            }
            Decomposition::Atomic { profile, .. } => {
                if profile.service_ref.is_some() && profile.codelet.is_some() {
                    report.warnings.push(VerifyError {
                        message: "both service_ref and codelet set; service_ref wins at runtime"
                            .to_string(),
                        element_id: Some(task.id.clone()),
                    });
                }
                if let Some(service_ref) = &profile.service_ref {
                    if !known_handlers.contains(service_ref) {
                        report.warnings.push(VerifyError {
                            message: format!(
                                "service_ref `{service_ref}` does not resolve to a registered handler"
                            ),
                            element_id: Some(task.id.clone()),
                        });
                    }
                }
            }
        }
    }
}

/// Every element must lie on a directed path from the input condition to the
/// output condition.
fn reachability(net: &NetSpec, report: &mut VerifyReport) {
    let mut graph: DiGraph<ElementId, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for element in net.elements.values() {
        let idx = graph.add_node(element.id().to_string());
        index.insert(element.id(), idx);
    }
    for element in net.elements.values() {
        match element {
            NetElement::Condition(c) => {
                for target in &c.flows_to {
                    if let Some(&to) = index.get(target.as_str()) {
                        graph.add_edge(index[c.id.as_str()], to, ());
                    }
                }
            }
            NetElement::Task(t) => {
                for flow in &t.flows {
                    if let Some(&to) = index.get(flow.target.as_str()) {
                        graph.add_edge(index[t.id.as_str()], to, ());
                    }
                }
            }
        }
    }

    let input_idx = index[net.input_condition().as_str()];
    let mut forward: HashSet<NodeIndex> = HashSet::new();
    let mut dfs = Dfs::new(&graph, input_idx);
    while let Some(nx) = dfs.next(&graph) {
        forward.insert(nx);
    }

    let output_idx = index[net.output_condition().as_str()];
    let reversed = Reversed(&graph);
    let mut backward: HashSet<NodeIndex> = HashSet::new();
    let mut rdfs = Dfs::new(reversed, output_idx);
    while let Some(nx) = rdfs.next(reversed) {
        backward.insert(nx);
    }

    for idx in graph.node_indices() {
        if !forward.contains(&idx) {
            report.errors.push(VerifyError {
                message: format!("element not reachable from input condition of net `{}`", net.id),
                element_id: Some(graph[idx].clone()),
            });
        }
        if !backward.contains(&idx) {
            report.errors.push(VerifyError {
                message: format!(
                    "element cannot reach the output condition of net `{}`",
                    net.id
                ),
                element_id: Some(graph[idx].clone()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::model::{NetBuilder, TaskSpec};
    use crate::types::{CreationMode, ExecutionProfile, MultiInstance, SplitCode};

    fn handlers() -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn linear_net() -> NetSpec {
        NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(TaskSpec::atomic("A", ExecutionProfile::manual()).flow_to("o"))
            .flow("i", "A")
            .build()
    }

    #[test]
    fn accepts_minimal_linear_net() {
        let spec = Specification::new("s", linear_net());
        let report = verify(&spec, &handlers());
        assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn rejects_unreachable_element() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .condition("orphan")
            .task(TaskSpec::atomic("A", ExecutionProfile::manual()).flow_to("o"))
            .flow("i", "A")
            .build();
        let spec = Specification::new("s", net);

        let report = verify(&spec, &handlers());
        assert!(report
            .errors
            .iter()
            .any(|e| e.element_id.as_deref() == Some("orphan")
                && e.message.contains("not reachable")));
    }

    #[test]
    fn rejects_xor_split_without_default() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .condition("c1")
            .task(
                TaskSpec::atomic("A", ExecutionProfile::manual())
                    .split(SplitCode::Xor)
                    .flow_if("c1", crate::data::Predicate::truthy("go"))
                    .flow_to("o"),
            )
            .task(TaskSpec::atomic("B", ExecutionProfile::manual()).flow_to("o"))
            .flow("i", "A")
            .flow("c1", "B")
            .build();
        let spec = Specification::new("s", net);

        let report = verify(&spec, &handlers());
        assert!(report
            .errors
            .iter()
            .any(|e| e.message.contains("exactly one default flow")));
    }

    #[test]
    fn rejects_bad_multi_instance_bounds() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(
                TaskSpec::atomic("M", ExecutionProfile::manual())
                    .multi_instance(MultiInstance {
                        min: 3,
                        max: 5,
                        threshold: 2, // threshold < min
                        creation: CreationMode::Static,
                        wait_for_all: false,
                    })
                    .flow_to("o"),
            )
            .flow("i", "M")
            .build();
        let spec = Specification::new("s", net);

        let report = verify(&spec, &handlers());
        assert!(report
            .errors
            .iter()
            .any(|e| e.message.contains("min ≤ threshold ≤ max")));
    }

    #[test]
    fn rejects_foreign_cancellation_region() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(
                TaskSpec::atomic("A", ExecutionProfile::manual())
                    .cancels(["ghost"])
                    .flow_to("o"),
            )
            .flow("i", "A")
            .build();
        let spec = Specification::new("s", net);

        let report = verify(&spec, &handlers());
        assert!(report
            .errors
            .iter()
            .any(|e| e.message.contains("cancellation region")));
    }

    #[test]
    fn warns_on_unresolved_service_ref() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(
                TaskSpec::atomic("A", ExecutionProfile::service("http://nowhere/svc"))
                    .flow_to("o"),
            )
            .flow("i", "A")
            .build();
        let spec = Specification::new("s", net);

        let report = verify(&spec, &handlers());
        assert!(report.is_ok());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.message.contains("does not resolve")));
    }

    #[test]
    fn rejects_composite_with_unknown_subnet() {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(TaskSpec::composite("C", "missing").flow_to("o"))
            .flow("i", "C")
            .build();
        let spec = Specification::new("s", net);

        let report = verify(&spec, &handlers());
        assert!(report
            .errors
            .iter()
            .any(|e| e.message.contains("unknown net")));
    }
}
