//! Built-in node handlers.
//!
//! These are the leaf-free node types the engine ships with: arithmetic and
//! string nodes for wiring demos and tests, a delay node, and a failure
//! injector. Real I/O nodes (db, crawl, chat, subprocess) live outside the
//! core and plug in through the same [`NodeFactory`] contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::handler::{ExecutionContext, FnFactory, NodeError, NodeFactory, NodeHandler};
use super::registry::{CatalogError, NodeRegistry};
use super::spec::{NodeSpec, OutputField, ParamKind, ParamSpec};
use crate::workflow::LOOP_NODE_TYPE;

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

enum Num {
    Int(i64),
    Float(f64),
}

fn numeric_param(params: &Value, name: &str) -> Result<Num, NodeError> {
    let value = params
        .get(name)
        .ok_or_else(|| NodeError::validation(format!("missing param '{name}'")))?;
    if let Some(i) = value.as_i64() {
        Ok(Num::Int(i))
    } else if let Some(f) = value.as_f64() {
        Ok(Num::Float(f))
    } else {
        Err(NodeError::validation(format!(
            "param '{name}' is not a number: {value}"
        )))
    }
}

/// Integer arithmetic is preserved when both operands are integers.
fn combine(a: Num, b: Num, int_op: fn(i64, i64) -> i64, float_op: fn(f64, f64) -> f64) -> Value {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => json!(int_op(x, y)),
        (Num::Int(x), Num::Float(y)) => json!(float_op(x as f64, y)),
        (Num::Float(x), Num::Int(y)) => json!(float_op(x, y as f64)),
        (Num::Float(x), Num::Float(y)) => json!(float_op(x, y)),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct AddHandler;

#[async_trait]
impl NodeHandler for AddHandler {
    async fn run(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let a = numeric_param(&params, "num1")?;
        let b = numeric_param(&params, "num2")?;
        Ok(json!({ "result": combine(a, b, |x, y| x + y, |x, y| x + y) }))
    }
}

struct MultiplyHandler;

#[async_trait]
impl NodeHandler for MultiplyHandler {
    async fn run(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let a = numeric_param(&params, "num1")?;
        let b = numeric_param(&params, "num2")?;
        Ok(json!({ "result": combine(a, b, |x, y| x * y, |x, y| x * y) }))
    }
}

/// Echoes its `value` param back as the node output, unwrapped.
struct EchoHandler;

#[async_trait]
impl NodeHandler for EchoHandler {
    async fn run(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        params
            .get("value")
            .cloned()
            .ok_or_else(|| NodeError::validation("missing param 'value'"))
    }
}

struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn run(&self, params: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let ms = params
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| NodeError::validation("param 'ms' must be a non-negative integer"))?;
        ctx.progress(json!({ "sleeping_ms": ms }));
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Renders `{name}` placeholders in `template` from the `vars` mapping.
struct TemplateHandler;

#[async_trait]
impl NodeHandler for TemplateHandler {
    async fn run(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let template = params
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::validation("param 'template' must be a string"))?;
        let empty = serde_json::Map::new();
        let vars = params
            .get("vars")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut text = template.to_string();
        for (name, value) in vars {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("{{{name}}}"), &rendered);
        }
        Ok(json!({ "text": text }))
    }
}

/// Fails its first `fail_times` invocations, then succeeds.
///
/// Retries reuse the handler instance, so the counter spans attempts of one
/// node execution.
struct FlakyHandler {
    attempts: AtomicU64,
}

#[async_trait]
impl NodeHandler for FlakyHandler {
    async fn run(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let fail_times = params
            .get("fail_times")
            .and_then(Value::as_u64)
            .ok_or_else(|| NodeError::validation("param 'fail_times' must be a non-negative integer"))?;
        let transient = params
            .get("transient")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("injected failure");

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= fail_times {
            let msg = format!("{message} (attempt {attempt})");
            if transient {
                Err(NodeError::transient(msg))
            } else {
                Err(NodeError::permanent(msg))
            }
        } else {
            Ok(json!({ "result": "ok", "attempts": attempt }))
        }
    }
}

/// Placeholder behind the `loop` catalog entry; the scheduler expands loop
/// nodes itself and never invokes this.
struct LoopPlaceholderHandler;

#[async_trait]
impl NodeHandler for LoopPlaceholderHandler {
    async fn run(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        Err(NodeError::executor_bug(
            "loop nodes are expanded by the scheduler",
        ))
    }
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

fn math_spec(node_type: &str, name: &str, description: &str) -> NodeSpec {
    NodeSpec {
        node_type: node_type.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        outputs: vec![OutputField::new("result", "the computed value")],
        params: vec![
            ParamSpec::required("num1", ParamKind::Float, "left operand"),
            ParamSpec::required("num2", ParamKind::Float, "right operand"),
        ],
        retryable: false,
        default_timeout_secs: 60,
        isolated: false,
    }
}

fn echo_spec() -> NodeSpec {
    NodeSpec {
        node_type: "echo".to_string(),
        name: "Echo".to_string(),
        description: "Returns its input value unchanged".to_string(),
        outputs: vec![OutputField::new("value", "the echoed value")],
        params: vec![ParamSpec::required("value", ParamKind::Any, "value to echo")],
        retryable: false,
        default_timeout_secs: 60,
        isolated: false,
    }
}

fn delay_spec() -> NodeSpec {
    NodeSpec {
        node_type: "delay".to_string(),
        name: "Delay".to_string(),
        description: "Sleeps for the given number of milliseconds".to_string(),
        outputs: vec![OutputField::new("slept_ms", "actual sleep duration")],
        params: vec![ParamSpec::required(
            "ms",
            ParamKind::Integer,
            "milliseconds to sleep",
        )],
        retryable: false,
        default_timeout_secs: 60,
        isolated: false,
    }
}

fn template_spec() -> NodeSpec {
    NodeSpec {
        node_type: "template".to_string(),
        name: "Template".to_string(),
        description: "Renders {name} placeholders from a variable mapping".to_string(),
        outputs: vec![OutputField::new("text", "rendered text")],
        params: vec![
            ParamSpec::required("template", ParamKind::String, "template text"),
            ParamSpec::optional(
                "vars",
                ParamKind::Mapping,
                Some(json!({})),
                "placeholder values",
            ),
        ],
        retryable: false,
        default_timeout_secs: 60,
        isolated: false,
    }
}

fn flaky_spec() -> NodeSpec {
    NodeSpec {
        node_type: "flaky".to_string(),
        name: "Flaky".to_string(),
        description: "Fails a configurable number of times, then succeeds".to_string(),
        outputs: vec![
            OutputField::new("result", "\"ok\" once the node succeeds"),
            OutputField::new("attempts", "attempts consumed"),
        ],
        params: vec![
            ParamSpec::required("fail_times", ParamKind::Integer, "failures to inject"),
            ParamSpec::optional(
                "transient",
                ParamKind::Boolean,
                Some(json!(true)),
                "classify injected failures as transient",
            ),
            ParamSpec::optional("message", ParamKind::String, None, "injected error message"),
        ],
        retryable: true,
        default_timeout_secs: 60,
        isolated: false,
    }
}

fn loop_spec() -> NodeSpec {
    NodeSpec {
        node_type: LOOP_NODE_TYPE.to_string(),
        name: "Loop".to_string(),
        description: "Runs a nested workflow once per element of a sequence".to_string(),
        outputs: vec![
            OutputField::new("results", "per-iteration terminal outputs"),
            OutputField::new("total", "number of iterations"),
            OutputField::new("success", "whether every iteration completed"),
        ],
        params: vec![
            ParamSpec::required("array", ParamKind::Sequence, "sequence to iterate over"),
            ParamSpec::required("workflow_json", ParamKind::Mapping, "nested workflow document"),
            ParamSpec::optional(
                "continue_on_error",
                ParamKind::Boolean,
                Some(json!(false)),
                "keep iterating past a failed iteration",
            ),
        ],
        retryable: false,
        default_timeout_secs: 60,
        isolated: false,
    }
}

// ---------------------------------------------------------------------------
// Registry assembly
// ---------------------------------------------------------------------------

fn stateless(handler: fn() -> Box<dyn NodeHandler>) -> Arc<dyn NodeFactory> {
    Arc::new(FnFactory(handler))
}

/// Frozen registry of every built-in node type, including the `loop` entry.
pub fn registry() -> Result<NodeRegistry, CatalogError> {
    builder().build()
}

/// Builder pre-loaded with the built-in registrations, for callers that
/// overlay a declarative catalog before freezing.
pub fn builder() -> crate::catalog::RegistryBuilder {
    NodeRegistry::builder()
        .register(
            math_spec("add", "Add", "Adds two numbers"),
            stateless(|| Box::new(AddHandler)),
        )
        .register(
            math_spec("multiply", "Multiply", "Multiplies two numbers"),
            stateless(|| Box::new(MultiplyHandler)),
        )
        .register(echo_spec(), stateless(|| Box::new(EchoHandler)))
        .register(delay_spec(), stateless(|| Box::new(DelayHandler)))
        .register(template_spec(), stateless(|| Box::new(TemplateHandler)))
        .register(
            flaky_spec(),
            stateless(|| {
                Box::new(FlakyHandler {
                    attempts: AtomicU64::new(0),
                })
            }),
        )
        .register(loop_spec(), stateless(|| Box::new(LoopPlaceholderHandler)))
}
