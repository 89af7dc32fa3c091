//! Workflow definitions and the workflow registry.
//!
//! A workflow is a named graph. Definitions are usually loaded from JSON:
//!
//! ```json
//! { "name": "orders", "description": "Ship paid orders", "graph": { ... } }
//! ```

use crate::error::EngineError;
use crate::graph::WorkflowGraph;
use crate::registry::FunctionRegistry;
use crate::validate::{ValidationReport, validate};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A named workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow name; also the queue namespace.
    pub name: String,
    /// Description of what this workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The workflow graph.
    pub graph: WorkflowGraph,
}

impl Workflow {
    #[must_use]
    pub fn new(name: impl Into<String>, graph: WorkflowGraph) -> Self {
        Self {
            name: name.into(),
            description: None,
            graph,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parses a definition from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid definition.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// SHA-256 of the graph; runs remember it to detect redefinition.
    #[must_use]
    pub fn graph_hash(&self) -> String {
        self.graph.content_hash()
    }
}

/// A validated workflow with its hash computed once.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    pub workflow: Workflow,
    pub graph_hash: String,
}

/// Workflows available to the runner, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<RegisteredWorkflow>>,
}

impl WorkflowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a workflow, replacing one with the same name.
    ///
    /// Warnings are logged; any error rejects the workflow.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWorkflow` with every validation error found.
    pub fn register(
        &mut self,
        workflow: Workflow,
        functions: &FunctionRegistry,
    ) -> Result<ValidationReport, Report<EngineError>> {
        let report = validate(&workflow.graph, functions);
        if !report.is_valid() {
            return Err(EngineError::InvalidWorkflow {
                name: workflow.name,
                errors: report.errors,
            }
            .into());
        }

        for warning in &report.warnings {
            warn!(workflow = %workflow.name, %warning, "workflow validation warning");
        }

        let graph_hash = workflow.graph_hash();
        info!(workflow = %workflow.name, graph_hash = %graph_hash, nodes = workflow.graph.len(), "registered workflow");
        self.workflows.insert(
            workflow.name.clone(),
            Arc::new(RegisteredWorkflow {
                workflow,
                graph_hash,
            }),
        );
        Ok(report)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredWorkflow>> {
        self.workflows.get(name).cloned()
    }

    /// Registered workflow names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeInstance;
    use crate::registry::FunctionSpec;
    use serde_json::json;

    fn functions() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        functions.register_fn("work", FunctionSpec::new(), |input, _| async move { Ok(input) });
        functions
    }

    #[test]
    fn parses_definition_json() {
        let bytes = serde_json::to_vec(&json!({
            "name": "orders",
            "description": "ship paid orders",
            "graph": {
                "a": { "nodeId": "work", "next": "b" },
                "b": { "nodeId": "work" }
            }
        }))
        .unwrap();

        let workflow = Workflow::from_json_bytes(&bytes).unwrap();
        assert_eq!(workflow.name, "orders");
        assert_eq!(workflow.description.as_deref(), Some("ship paid orders"));
        assert_eq!(workflow.graph.len(), 2);
    }

    #[test]
    fn registers_valid_workflow() {
        let mut registry = WorkflowRegistry::new();
        let workflow = Workflow::new(
            "orders",
            WorkflowGraph::new().with("a", NodeInstance::new("work")),
        );
        let expected_hash = workflow.graph_hash();

        registry.register(workflow, &functions()).unwrap();

        let registered = registry.get("orders").unwrap();
        assert_eq!(registered.graph_hash, expected_hash);
        assert_eq!(registry.names(), vec!["orders"]);
    }

    #[test]
    fn rejects_invalid_workflow() {
        let mut registry = WorkflowRegistry::new();
        let workflow = Workflow::new(
            "broken",
            WorkflowGraph::new().with("a", NodeInstance::new("missing")),
        );

        let err = registry.register(workflow, &functions()).unwrap_err();
        assert!(err.to_string().contains("unknown function 'missing'"));
        assert!(registry.is_empty());
    }

    #[test]
    fn warnings_do_not_block_registration() {
        let mut registry = WorkflowRegistry::new();
        let workflow = Workflow::new(
            "loose",
            WorkflowGraph::new()
                .with("a", NodeInstance::new("work"))
                .with("x", NodeInstance::new("work").then("x").max_iterations(2)),
        );

        let report = registry.register(workflow, &functions()).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
