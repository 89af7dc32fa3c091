//! Function registry and the invoker contract.
//!
//! Every `nodeId` in a workflow graph names a function registered here at
//! startup. The registry carries a [`FunctionSpec`] per function describing
//! its control-flow contract, and implements [`Invoker`] by dispatching on
//! the name.

use crate::graph::{ExecutionMode, NodeInstance};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-invocation context handed to a function.
///
/// Clones share the branch selection, so the executor can read back what the
/// function chose after the call returns.
#[derive(Debug, Clone)]
pub struct GraphContext {
    instance_id: String,
    iteration: u32,
    selected: Arc<Mutex<Option<String>>>,
}

impl GraphContext {
    #[must_use]
    pub fn new(instance_id: impl Into<String>, iteration: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            iteration,
            selected: Arc::new(Mutex::new(None)),
        }
    }

    /// The instance being executed.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Number of prior completions of this instance within the run.
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Selects the outgoing branch. The last call wins.
    pub fn branch(&self, name: impl Into<String>) {
        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        *selected = Some(name.into());
    }

    /// Returns the branch selected so far, if any.
    #[must_use]
    pub fn selected_branch(&self) -> Option<String> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Failure reported by a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeError {
    pub message: String,
    pub code: Option<String>,
}

impl InvokeError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InvokeError {}

/// Executes business logic by name.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invokes the named function with resolved input.
    async fn invoke(
        &self,
        name: &str,
        input: JsonValue,
        ctx: GraphContext,
    ) -> Result<JsonValue, InvokeError>;
}

/// Branch names a function can emit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BranchSet {
    /// The function never selects a branch.
    #[default]
    None,
    /// A fixed set of branch names.
    Fixed(Vec<String>),
    /// Branch names listed in a literal input field, plus a fallback.
    FromInput { field: String, fallback: String },
}

impl BranchSet {
    /// Returns the branches this function can emit for the given instance.
    ///
    /// `None` means the set cannot be known before run time.
    #[must_use]
    pub fn emitted_by(&self, node: &NodeInstance) -> Option<BTreeSet<String>> {
        match self {
            Self::None => Some(BTreeSet::new()),
            Self::Fixed(names) => Some(names.iter().cloned().collect()),
            Self::FromInput { field, fallback } => {
                let literal = match node.input.get(field)? {
                    crate::graph::InputValue::Literal(JsonValue::Array(items)) => items,
                    _ => return None,
                };
                let mut names: BTreeSet<String> = literal
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect();
                names.insert(fallback.clone());
                Some(names)
            }
        }
    }
}

/// Control-flow contract of a registered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub branches: BranchSet,
    pub error_channel: bool,
    pub loop_bounded: bool,
    pub mode: ExecutionMode,
}

impl Default for FunctionSpec {
    fn default() -> Self {
        Self {
            branches: BranchSet::None,
            error_channel: true,
            loop_bounded: false,
            mode: ExecutionMode::Inline,
        }
    }
}

impl FunctionSpec {
    /// An inline function with an error channel and no branches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn branches<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches = BranchSet::Fixed(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn branch_set(mut self, branches: BranchSet) -> Self {
        self.branches = branches;
        self
    }

    #[must_use]
    pub fn without_error_channel(mut self) -> Self {
        self.error_channel = false;
        self
    }

    #[must_use]
    pub fn loop_bounded(mut self) -> Self {
        self.loop_bounded = true;
        self
    }

    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.mode = ExecutionMode::Deferred;
        self
    }
}

/// Boxed async function handler.
pub type FunctionHandler = Arc<
    dyn Fn(JsonValue, GraphContext) -> BoxFuture<'static, Result<JsonValue, InvokeError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
struct RegisteredFunction {
    spec: FunctionSpec,
    handler: FunctionHandler,
}

/// Functions available to workflow graphs, keyed by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a boxed handler, replacing any function with the same name.
    pub fn register(&mut self, name: impl Into<String>, spec: FunctionSpec, handler: FunctionHandler) {
        self.functions
            .insert(name.into(), RegisteredFunction { spec, handler });
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, spec: FunctionSpec, f: F)
    where
        F: Fn(JsonValue, GraphContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, InvokeError>> + Send + 'static,
    {
        let handler: FunctionHandler = Arc::new(move |input, ctx| Box::pin(f(input, ctx)));
        self.register(name, spec, handler);
    }

    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(name).map(|f| &f.spec)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered function names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolves the execution mode of an instance.
    ///
    /// The instance override wins over the function's declared mode.
    #[must_use]
    pub fn mode_for(&self, node: &NodeInstance) -> ExecutionMode {
        node.mode
            .or_else(|| self.spec(&node.node_id).map(|spec| spec.mode))
            .unwrap_or_default()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[async_trait]
impl Invoker for FunctionRegistry {
    async fn invoke(
        &self,
        name: &str,
        input: JsonValue,
        ctx: GraphContext,
    ) -> Result<JsonValue, InvokeError> {
        let Some(function) = self.functions.get(name) else {
            return Err(InvokeError::new(format!("unknown function '{name}'"))
                .with_code("unknown_function"));
        };
        (function.handler)(input, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("double", FunctionSpec::new(), |input, _ctx| async move {
            let n = input["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });
        registry.register_fn(
            "pick",
            FunctionSpec::new().branches(["left", "right"]),
            |input, ctx| async move {
                ctx.branch(if input["left"] == json!(true) { "left" } else { "right" });
                Ok(JsonValue::Null)
            },
        );
        registry
    }

    #[tokio::test]
    async fn invokes_by_name() {
        let output = registry()
            .invoke("double", json!({"n": 21}), GraphContext::new("a", 0))
            .await
            .unwrap();
        assert_eq!(output, json!(42));
    }

    #[tokio::test]
    async fn unknown_function_is_an_invoke_error() {
        let err = registry()
            .invoke("missing", json!({}), GraphContext::new("a", 0))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("unknown_function"));
    }

    #[tokio::test]
    async fn branch_selection_is_shared_with_clones() {
        let ctx = GraphContext::new("p", 3);
        registry()
            .invoke("pick", json!({"left": true}), ctx.clone())
            .await
            .unwrap();
        assert_eq!(ctx.selected_branch().as_deref(), Some("left"));
        assert_eq!(ctx.iteration(), 3);
    }

    #[test]
    fn instance_mode_overrides_function_mode() {
        let mut registry = registry();
        registry.register_fn("slow", FunctionSpec::new().deferred(), |input, _| async move {
            Ok(input)
        });

        let plain = NodeInstance::new("slow");
        let forced = NodeInstance::new("slow").mode(ExecutionMode::Inline);
        assert_eq!(registry.mode_for(&plain), ExecutionMode::Deferred);
        assert_eq!(registry.mode_for(&forced), ExecutionMode::Inline);
        assert_eq!(registry.mode_for(&NodeInstance::new("double")), ExecutionMode::Inline);
    }

    #[test]
    fn branch_set_from_literal_input() {
        let set = BranchSet::FromInput {
            field: "cases".to_string(),
            fallback: "default".to_string(),
        };
        let node = NodeInstance::new("switchCase").with_literal("cases", json!(["a", "b"]));
        let emitted = set.emitted_by(&node).unwrap();
        assert_eq!(
            emitted.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "default".to_string()]
        );

        let dynamic = NodeInstance::new("switchCase")
            .with_ref("cases", crate::graph::DataRef::trigger().at("cases"));
        assert!(set.emitted_by(&dynamic).is_none());
    }
}
