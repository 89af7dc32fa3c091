//! Definition-time validation of workflow graphs.
//!
//! All rules run against the whole graph and their findings are collected,
//! so a single pass reports every problem in a definition.

use crate::error::{GraphError, GraphWarning};
use crate::graph::{DEFAULT_BRANCH, EdgeKind, Next, TRIGGER_SOURCE, WorkflowGraph};
use crate::registry::FunctionRegistry;
use petgraph::algo::tarjan_scc;
use std::collections::{BTreeSet, VecDeque};

/// Findings from validating a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<GraphError>,
    pub warnings: Vec<GraphWarning>,
}

impl ValidationReport {
    /// Returns true if no errors were found. Warnings do not count.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates a graph against the functions it may call.
#[must_use]
pub fn validate(graph: &WorkflowGraph, functions: &FunctionRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_instances(graph, functions, &mut report.errors);
    check_cycles(graph, functions, &mut report.errors);
    report.warnings = unreachable_instances(graph)
        .into_iter()
        .map(|instance_id| GraphWarning::Unreachable { instance_id })
        .collect();

    report
}

fn check_instances(graph: &WorkflowGraph, functions: &FunctionRegistry, errors: &mut Vec<GraphError>) {
    for (id, node) in graph.iter() {
        if id == TRIGGER_SOURCE {
            errors.push(GraphError::ReservedInstanceId {
                instance_id: id.to_string(),
            });
        }

        for (field, data_ref) in node.refs() {
            if !data_ref.is_trigger() && !graph.contains(&data_ref.source_id) {
                errors.push(GraphError::UnresolvedRef {
                    instance_id: id.to_string(),
                    field: field.to_string(),
                    source_id: data_ref.source_id.clone(),
                });
            }
        }

        for target in node.control_targets() {
            if !graph.contains(target) {
                errors.push(GraphError::UnknownTarget {
                    instance_id: id.to_string(),
                    target: target.to_string(),
                });
            }
        }

        let Some(spec) = functions.spec(&node.node_id) else {
            errors.push(GraphError::UnknownFunction {
                instance_id: id.to_string(),
                node_id: node.node_id.clone(),
            });
            continue;
        };

        if node.on_error.is_some() && !spec.error_channel {
            errors.push(GraphError::ErrorChannelUnsupported {
                instance_id: id.to_string(),
                node_id: node.node_id.clone(),
            });
        }

        if let Some(Next::Conditional(branches)) = &node.next {
            if branches.contains_key(DEFAULT_BRANCH) {
                continue;
            }
            let missing: Vec<String> = match spec.branches.emitted_by(node) {
                Some(emitted) => emitted
                    .into_iter()
                    .filter(|name| !branches.contains_key(name))
                    .collect(),
                // Branch names only known at run time: only a default covers them.
                None => vec![DEFAULT_BRANCH.to_string()],
            };
            if !missing.is_empty() {
                errors.push(GraphError::UncoveredBranches {
                    instance_id: id.to_string(),
                    missing,
                });
            }
        }
    }
}

fn check_cycles(graph: &WorkflowGraph, functions: &FunctionRegistry, errors: &mut Vec<GraphError>) {
    let (analysis, _) = graph.analysis_graph();
    let control = analysis.filter_map(
        |_, id| Some(*id),
        |_, kind| (*kind != EdgeKind::Data).then_some(*kind),
    );

    for component in tarjan_scc(&control) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&idx| control.contains_edge(idx, idx));
        if !is_cycle {
            continue;
        }

        let members: BTreeSet<&str> = component.iter().map(|&idx| control[idx]).collect();
        let bounded = members.iter().any(|id| {
            graph.get(id).is_some_and(|node| {
                node.max_iterations.is_some()
                    || functions
                        .spec(&node.node_id)
                        .is_some_and(|spec| spec.loop_bounded)
            })
        });
        if !bounded {
            errors.push(GraphError::UnboundedCycle {
                members: members.into_iter().map(str::to_string).collect(),
            });
        }
    }
}

/// Returns instances no control path reaches from a root.
fn unreachable_instances(graph: &WorkflowGraph) -> Vec<String> {
    let mut seen: BTreeSet<String> = graph.roots();
    let mut queue: VecDeque<String> = seen.iter().cloned().collect();

    while let Some(id) = queue.pop_front() {
        let Some(node) = graph.get(&id) else {
            continue;
        };
        for target in node.control_targets() {
            if graph.contains(target) && seen.insert(target.to_string()) {
                queue.push_back(target.to_string());
            }
        }
    }

    graph
        .iter()
        .map(|(id, _)| id)
        .filter(|id| !seen.contains(*id))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataRef, NodeInstance, Targets};
    use crate::registry::{BranchSet, FunctionSpec};
    use serde_json::json;

    fn functions() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        functions.register_fn("work", FunctionSpec::new(), |input, _| async move { Ok(input) });
        functions.register_fn(
            "ifCondition",
            FunctionSpec::new()
                .branches(["true", "false"])
                .without_error_channel(),
            |input, _| async move { Ok(input) },
        );
        functions.register_fn(
            "switchCase",
            FunctionSpec::new().branch_set(BranchSet::FromInput {
                field: "cases".to_string(),
                fallback: "default".to_string(),
            }),
            |input, _| async move { Ok(input) },
        );
        functions.register_fn(
            "whileLoop",
            FunctionSpec::new()
                .branches(["continue", "done"])
                .loop_bounded(),
            |input, _| async move { Ok(input) },
        );
        functions
    }

    #[test]
    fn valid_linear_graph() {
        let graph = WorkflowGraph::new()
            .with("a", NodeInstance::new("work").with_ref("x", DataRef::trigger()).then("b"))
            .with("b", NodeInstance::new("work").with_ref("x", DataRef::new("a")));

        let report = validate(&graph, &functions());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn collects_every_error() {
        let graph = WorkflowGraph::new()
            .with("trigger", NodeInstance::new("work"))
            .with(
                "a",
                NodeInstance::new("nope")
                    .with_ref("x", DataRef::new("ghost"))
                    .then("missing"),
            );

        let report = validate(&graph, &functions());
        assert!(report.errors.contains(&GraphError::ReservedInstanceId {
            instance_id: "trigger".to_string()
        }));
        assert!(report.errors.contains(&GraphError::UnresolvedRef {
            instance_id: "a".to_string(),
            field: "x".to_string(),
            source_id: "ghost".to_string(),
        }));
        assert!(report.errors.contains(&GraphError::UnknownTarget {
            instance_id: "a".to_string(),
            target: "missing".to_string(),
        }));
        assert!(report.errors.contains(&GraphError::UnknownFunction {
            instance_id: "a".to_string(),
            node_id: "nope".to_string(),
        }));
    }

    #[test]
    fn conditional_must_cover_branches_or_default() {
        let partial = WorkflowGraph::new()
            .with("check", NodeInstance::new("ifCondition").branch("true", "yes"))
            .with("yes", NodeInstance::new("work"));
        let report = validate(&partial, &functions());
        assert_eq!(
            report.errors,
            vec![GraphError::UncoveredBranches {
                instance_id: "check".to_string(),
                missing: vec!["false".to_string()],
            }]
        );

        let defaulted = WorkflowGraph::new()
            .with(
                "check",
                NodeInstance::new("ifCondition")
                    .branch("true", "yes")
                    .branch("default", "yes"),
            )
            .with("yes", NodeInstance::new("work"));
        assert!(validate(&defaulted, &functions()).is_valid());
    }

    #[test]
    fn switch_case_branches_come_from_cases() {
        let graph = WorkflowGraph::new()
            .with(
                "route",
                NodeInstance::new("switchCase")
                    .with_literal("cases", json!(["eu", "us"]))
                    .branch("eu", "a")
                    .branch("us", "a"),
            )
            .with("a", NodeInstance::new("work"));

        let report = validate(&graph, &functions());
        assert_eq!(
            report.errors,
            vec![GraphError::UncoveredBranches {
                instance_id: "route".to_string(),
                missing: vec!["default".to_string()],
            }]
        );
    }

    #[test]
    fn on_error_requires_error_channel() {
        let graph = WorkflowGraph::new()
            .with(
                "check",
                NodeInstance::new("ifCondition")
                    .branch("true", "h")
                    .branch("false", "h")
                    .on_error("h"),
            )
            .with("h", NodeInstance::new("work"));

        let report = validate(&graph, &functions());
        assert_eq!(
            report.errors,
            vec![GraphError::ErrorChannelUnsupported {
                instance_id: "check".to_string(),
                node_id: "ifCondition".to_string(),
            }]
        );
    }

    #[test]
    fn unbounded_cycle_is_flagged() {
        let graph = WorkflowGraph::new()
            .with("start", NodeInstance::new("work").then("a"))
            .with("a", NodeInstance::new("work").then("b"))
            .with("b", NodeInstance::new("work").then("a"));

        let report = validate(&graph, &functions());
        assert_eq!(
            report.errors,
            vec![GraphError::UnboundedCycle {
                members: vec!["a".to_string(), "b".to_string()],
            }]
        );
    }

    #[test]
    fn bounded_cycles_are_legal() {
        let explicit = WorkflowGraph::new()
            .with("start", NodeInstance::new("work").then("a"))
            .with("a", NodeInstance::new("work").then("a").max_iterations(5));
        assert!(validate(&explicit, &functions()).is_valid());

        let looped = WorkflowGraph::new()
            .with("start", NodeInstance::new("work").then("loop"))
            .with(
                "loop",
                NodeInstance::new("whileLoop")
                    .branch("continue", "body")
                    .branch("done", "end"),
            )
            .with("body", NodeInstance::new("work").then("loop"))
            .with("end", NodeInstance::new("work"));
        assert!(validate(&looped, &functions()).is_valid());
    }

    #[test]
    fn self_loop_without_bound_is_flagged() {
        let graph = WorkflowGraph::new()
            .with("start", NodeInstance::new("work").then("a"))
            .with("a", NodeInstance::new("work").on_error(Targets::One("a".to_string())));

        let report = validate(&graph, &functions());
        assert_eq!(
            report.errors,
            vec![GraphError::UnboundedCycle {
                members: vec!["a".to_string()],
            }]
        );
    }

    #[test]
    fn unreachable_cycle_is_a_warning() {
        let graph = WorkflowGraph::new()
            .with("a", NodeInstance::new("work"))
            .with("x", NodeInstance::new("work").then("y").max_iterations(2))
            .with("y", NodeInstance::new("work").then("x"));

        let report = validate(&graph, &functions());
        assert!(report.is_valid());
        assert_eq!(
            report.warnings,
            vec![
                GraphWarning::Unreachable {
                    instance_id: "x".to_string()
                },
                GraphWarning::Unreachable {
                    instance_id: "y".to_string()
                },
            ]
        );
    }
}
