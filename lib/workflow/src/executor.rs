//! Node execution: input resolution, invocation and control-flow interpretation.
//!
//! Executing an instance is split into three steps so deferred execution can
//! reuse the first and last:
//!
//! 1. [`resolve_inputs`] reads literals and `$ref`s against the run state.
//! 2. [`NodeExecutor::invoke`] calls the function through the invoker.
//! 3. [`interpret`] and [`successors`] turn the invocation into a
//!    [`NodeExecutionResult`] and the instances it routes to.

use crate::error::{ErrorPayload, ExecutionError};
use crate::graph::{DEFAULT_BRANCH, InputValue, Next, NodeInstance, Targets};
use crate::registry::{GraphContext, InvokeError, Invoker};
use crate::run_state::{NodeExecutionResult, RunState};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

/// Raw outcome of calling a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub output: Result<JsonValue, InvokeError>,
    /// Branch selected through the context, if any.
    pub branch: Option<String>,
}

/// Executes instances through an invoker.
pub struct NodeExecutor<'a> {
    invoker: &'a dyn Invoker,
}

impl<'a> NodeExecutor<'a> {
    #[must_use]
    pub fn new(invoker: &'a dyn Invoker) -> Self {
        Self { invoker }
    }

    /// Invokes the instance's function with already-resolved input.
    pub async fn invoke(
        &self,
        instance_id: &str,
        node: &NodeInstance,
        input: JsonValue,
        iteration: u32,
    ) -> Invocation {
        let ctx = GraphContext::new(instance_id, iteration);
        let output = self
            .invoker
            .invoke(&node.node_id, input, ctx.clone())
            .await;
        Invocation {
            output,
            branch: ctx.selected_branch(),
        }
    }

    /// Resolves, invokes and interprets one execution of an instance.
    ///
    /// The runner runs these steps itself so it can batch inline invocations.
    #[cfg(test)]
    pub async fn execute(
        &self,
        instance_id: &str,
        node: &NodeInstance,
        state: &RunState,
    ) -> Result<(NodeExecutionResult, Vec<String>), ExecutionError> {
        let iteration = state.iteration_of(instance_id);
        let input = resolve_inputs(instance_id, node, state)?;
        let invocation = self.invoke(instance_id, node, input, iteration).await;
        let result = interpret(instance_id, node, iteration, invocation)?;
        let targets = successors(instance_id, node, &result)?;
        Ok((result, targets))
    }
}

/// Builds the input object for an instance.
///
/// # Errors
///
/// Returns `UnresolvedReference` if a `$ref` names an instance with no output.
pub fn resolve_inputs(
    instance_id: &str,
    node: &NodeInstance,
    state: &RunState,
) -> Result<JsonValue, ExecutionError> {
    let mut resolved = Map::new();
    for (field, value) in &node.input {
        let value = match value {
            InputValue::Literal(literal) => literal.clone(),
            InputValue::Ref(data_ref) => {
                let source = if data_ref.is_trigger() {
                    &state.input
                } else {
                    state
                        .completed
                        .get(&data_ref.source_id)
                        .and_then(|result| result.output.as_ref())
                        .ok_or_else(|| ExecutionError::UnresolvedReference {
                            instance_id: instance_id.to_string(),
                            source_id: data_ref.source_id.clone(),
                        })?
                };
                match &data_ref.path {
                    Some(path) => project(source, path),
                    None => source.clone(),
                }
            }
        };
        resolved.insert(field.clone(), value);
    }
    Ok(JsonValue::Object(resolved))
}

/// Follows a dot-notation path into a value.
///
/// Numeric segments index arrays. A segment that does not resolve yields
/// `null`.
#[must_use]
pub fn project(value: &JsonValue, path: &str) -> JsonValue {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            JsonValue::Object(map) => map.get(segment),
            JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return JsonValue::Null,
        }
    }
    current.clone()
}

/// Turns an invocation into a node result.
///
/// # Errors
///
/// Returns `MissingBranchSelection` when a conditional instance succeeded
/// without selecting a branch.
pub fn interpret(
    instance_id: &str,
    node: &NodeInstance,
    iteration: u32,
    invocation: Invocation,
) -> Result<NodeExecutionResult, ExecutionError> {
    let conditional = node.next.as_ref().is_some_and(Next::is_conditional);
    match invocation.output {
        Ok(output) => {
            if conditional && invocation.branch.is_none() {
                return Err(ExecutionError::MissingBranchSelection {
                    instance_id: instance_id.to_string(),
                });
            }
            if !conditional && invocation.branch.is_some() {
                debug!(instance = %instance_id, "ignoring branch selection on non-conditional instance");
            }
            let branch = invocation.branch.filter(|_| conditional);
            Ok(NodeExecutionResult::success(instance_id, iteration, output).with_branch(branch))
        }
        Err(e) => {
            let mut payload = ErrorPayload::new(e.message);
            payload.code = e.code;
            Ok(NodeExecutionResult::failure(instance_id, iteration, payload))
        }
    }
}

/// Returns the instances a result routes to.
///
/// # Errors
///
/// Returns `NodeFailed` for a failure with no `onError` route, and
/// `UnknownBranch` for a branch with no mapping and no `default`.
pub fn successors(
    instance_id: &str,
    node: &NodeInstance,
    result: &NodeExecutionResult,
) -> Result<Vec<String>, ExecutionError> {
    if let Some(error) = &result.error {
        return match &node.on_error {
            Some(targets) => Ok(targets.to_vec()),
            None => Err(ExecutionError::NodeFailed {
                instance_id: instance_id.to_string(),
                message: error.message.clone(),
                code: error.code.clone(),
            }),
        };
    }

    let Some(next) = &node.next else {
        return Ok(Vec::new());
    };
    match next {
        Next::Sequential(id) => Ok(vec![id.clone()]),
        Next::Parallel(ids) => Ok(ids.clone()),
        Next::Conditional(branches) => {
            let branch = result.selected_branch.as_deref().unwrap_or(DEFAULT_BRANCH);
            branches
                .get(branch)
                .or_else(|| branches.get(DEFAULT_BRANCH))
                .map(Targets::to_vec)
                .ok_or_else(|| ExecutionError::UnknownBranch {
                    instance_id: instance_id.to_string(),
                    branch: branch.to_string(),
                })
        }
    }
}
