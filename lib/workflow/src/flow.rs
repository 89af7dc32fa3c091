//! Built-in flow control behaviors.
//!
//! These are ordinary registered functions that drive routing through
//! [`GraphContext::branch`] and [`GraphContext::iteration`]; the runner has
//! no special knowledge of them.

use crate::registry::{BranchSet, FunctionRegistry, FunctionSpec, GraphContext, InvokeError};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;

pub const IF_CONDITION: &str = "ifCondition";
pub const SWITCH_CASE: &str = "switchCase";
pub const WHILE_LOOP: &str = "whileLoop";
pub const FOR_LOOP: &str = "forLoop";
pub const DELAY: &str = "delay";
pub const MERGE: &str = "merge";

/// Loop bound used when a loop node's input gives none.
pub const DEFAULT_LOOP_BOUND: u64 = 100;

/// Registers every flow control behavior.
pub fn register_flow_control(functions: &mut FunctionRegistry) {
    functions.register_fn(
        IF_CONDITION,
        FunctionSpec::new()
            .branches(["true", "false"])
            .without_error_channel(),
        |input, ctx| async move { Ok(if_condition(&input, &ctx)) },
    );
    functions.register_fn(
        SWITCH_CASE,
        FunctionSpec::new()
            .branch_set(BranchSet::FromInput {
                field: "cases".to_string(),
                fallback: "default".to_string(),
            })
            .without_error_channel(),
        |input, ctx| async move { Ok(switch_case(&input, &ctx)) },
    );
    functions.register_fn(
        WHILE_LOOP,
        FunctionSpec::new()
            .branches(["continue", "done"])
            .without_error_channel()
            .loop_bounded(),
        |input, ctx| async move { Ok(while_loop(&input, &ctx)) },
    );
    functions.register_fn(
        FOR_LOOP,
        FunctionSpec::new()
            .branches(["next", "done"])
            .without_error_channel()
            .loop_bounded(),
        |input, ctx| async move { Ok(for_loop(&input, &ctx)) },
    );
    functions.register_fn(
        DELAY,
        FunctionSpec::new().without_error_channel().deferred(),
        |input, _ctx| delay(input),
    );
    functions.register_fn(
        MERGE,
        FunctionSpec::new().without_error_channel(),
        |input, _ctx| async move { Ok(input) },
    );
}

/// JavaScript-style truthiness: `false`, `null`, `0`, `""` and empty
/// collections are false.
#[must_use]
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

fn bound(input: &JsonValue) -> u64 {
    input
        .get("maxIterations")
        .and_then(JsonValue::as_u64)
        .unwrap_or(DEFAULT_LOOP_BOUND)
}

fn if_condition(input: &JsonValue, ctx: &GraphContext) -> JsonValue {
    let condition = input.get("condition").is_some_and(is_truthy);
    ctx.branch(if condition { "true" } else { "false" });
    json!(condition)
}

fn switch_case(input: &JsonValue, ctx: &GraphContext) -> JsonValue {
    let value = input.get("value").cloned().unwrap_or(JsonValue::Null);
    let key = match &value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    let matched = input
        .get("cases")
        .and_then(JsonValue::as_array)
        .is_some_and(|cases| cases.iter().any(|case| case.as_str() == Some(key.as_str())));
    ctx.branch(if matched { key } else { "default".to_string() });
    value
}

fn while_loop(input: &JsonValue, ctx: &GraphContext) -> JsonValue {
    let iteration = u64::from(ctx.iteration());
    let proceed =
        iteration < bound(input) && input.get("condition").is_some_and(is_truthy);
    ctx.branch(if proceed { "continue" } else { "done" });
    json!({ "iteration": iteration })
}

fn for_loop(input: &JsonValue, ctx: &GraphContext) -> JsonValue {
    let iteration = u64::from(ctx.iteration());
    let count = input
        .get("count")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let limit = count.min(bound(input));
    ctx.branch(if iteration < limit { "next" } else { "done" });
    json!(iteration)
}

async fn delay(input: JsonValue) -> Result<JsonValue, InvokeError> {
    let millis = input
        .get("durationMs")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(json!({ "delayedMs": millis }))
}
