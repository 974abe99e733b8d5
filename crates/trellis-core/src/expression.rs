//! Expression evaluator
//!
//! JEXL expressions evaluated against two roots, `state` and `input`.
//! Expressions are parsed once at compile time (syntax errors surface
//! there) and the parsed tree is walked on every evaluation.

use jexl_parser::ast::{Expression, OpCode};
use jexl_parser::Parser;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, Result};

const EPSILON: f64 = 0.000001;

/// Truthiness used for predicates: booleans as-is, otherwise non-null and not `false`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    }
}

/// JEXL truthiness for `&&`, `||` and `?:` operands.
fn operand_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn expr_err(msg: impl Into<String>) -> CoreError {
    CoreError::ExpressionError(msg.into())
}

/// A parsed expression plus its text.
#[derive(Clone)]
struct Parsed {
    source: String,
    tree: Arc<Expression>,
}

impl Parsed {
    fn new(expr: &str) -> Result<Self> {
        if expr.trim().is_empty() {
            return Err(expr_err("expression is empty"));
        }
        let tree = Parser::parse(expr)
            .map_err(|e| expr_err(format!("failed to compile expression {:?}: {}", expr, e)))?;
        Ok(Self { source: expr.to_string(), tree: Arc::new(tree) })
    }

    fn eval(&self, state: &Value, input: &Value) -> Result<Value> {
        Scope { state, input }
            .walk(&self.tree)
            .map_err(|e| expr_err(format!("failed to evaluate {:?}: {}", self.source, e)))
    }
}

/// Evaluation roots
struct Scope<'a> {
    state: &'a Value,
    input: &'a Value,
}

/// Evaluation failure before the expression text is attached.
type WalkResult = std::result::Result<Value, String>;

impl Scope<'_> {
    fn walk(&self, expr: &Expression) -> WalkResult {
        match expr {
            Expression::Number(n) => Ok(json!(n)),
            Expression::Boolean(b) => Ok(json!(b)),
            Expression::String(s) => Ok(json!(s)),
            Expression::Array(items) => items.iter().map(|x| self.walk(x)).collect(),
            Expression::Object(items) => {
                let mut map = Map::with_capacity(items.len());
                for (key, value) in items {
                    if map.contains_key(key) {
                        return Err(format!("duplicate object key: {}", key));
                    }
                    map.insert(key.clone(), self.walk(value)?);
                }
                Ok(Value::Object(map))
            }
            Expression::Identifier(name) => match name.as_str() {
                "state" => Ok(self.state.clone()),
                "input" => Ok(self.input.clone()),
                other => Err(format!("identifier '{}' is undefined", other)),
            },
            Expression::DotOperation { subject, ident } => {
                Ok(self.walk(subject)?.get(ident).cloned().unwrap_or(Value::Null))
            }
            Expression::IndexOperation { subject, index } => self.index(subject, index),
            Expression::BinaryOperation { operation, left, right } => self.binary(*operation, left, right),
            Expression::Transform { name, subject, args } => {
                let mut values = vec![self.walk(subject)?];
                for arg in args.iter().flatten() {
                    values.push(self.walk(arg)?);
                }
                transform(name, &values)
            }
            Expression::Conditional { left, truthy, falsy } => {
                let pick = self.walk(left).map_or(false, |v| operand_truthy(&v));
                self.walk(if pick { truthy } else { falsy })
            }
            Expression::Filter { .. } => Err("filter outside of an index".to_string()),
        }
    }

    fn index(&self, subject: &Expression, index: &Expression) -> WalkResult {
        let subject = self.walk(subject)?;
        if let Expression::Filter { ident, op, right } = index {
            let items = subject.as_array().ok_or("filter on a non-array")?;
            let right = self.walk(right)?;
            let kept: Vec<Value> = items
                .iter()
                .filter(|item| {
                    let left = item.get(ident).cloned().unwrap_or(Value::Null);
                    apply(*op, left, right.clone()).map_or(false, |v| operand_truthy(&v))
                })
                .cloned()
                .collect();
            return Ok(Value::Array(kept));
        }
        match self.walk(index)? {
            Value::String(key) => Ok(subject.get(&key).cloned().unwrap_or(Value::Null)),
            Value::Number(n) => {
                let at = n.as_f64().unwrap_or(-1.0).floor();
                if at < 0.0 {
                    return Ok(Value::Null);
                }
                Ok(subject.get(at as usize).cloned().unwrap_or(Value::Null))
            }
            _ => Err("index must be a string or a number".to_string()),
        }
    }

    fn binary(&self, op: OpCode, left: &Expression, right: &Expression) -> WalkResult {
        let left = self.walk(left);
        match op {
            // right side only when it decides the result
            OpCode::Or => match left {
                Ok(v) if operand_truthy(&v) => Ok(v),
                _ => self.walk(right),
            },
            OpCode::And => match left {
                Ok(v) if operand_truthy(&v) => self.walk(right),
                other => other,
            },
            _ => apply(op, left?, self.walk(right)?),
        }
    }
}

fn apply(op: OpCode, left: Value, right: Value) -> WalkResult {
    match (op, left, right) {
        (OpCode::NotEqual, a, b) => {
            let equal = apply(OpCode::Equal, a, b)?;
            Ok(json!(!equal.as_bool().unwrap_or(false)))
        }
        (OpCode::And, a, b) => Ok(if operand_truthy(&a) { b } else { a }),
        (OpCode::Or, a, b) => Ok(if operand_truthy(&a) { a } else { b }),
        (op, Value::Number(a), Value::Number(b)) => {
            let (l, r) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            Ok(match op {
                OpCode::Add => json!(l + r),
                OpCode::Subtract => json!(l - r),
                OpCode::Multiply => json!(l * r),
                OpCode::Divide => json!(l / r),
                OpCode::FloorDivide => json!((l / r).floor()),
                OpCode::Modulus => json!(l % r),
                OpCode::Exponent => json!(l.powf(r)),
                OpCode::Less => json!(l < r),
                OpCode::Greater => json!(l > r),
                OpCode::LessEqual => json!(l <= r),
                OpCode::GreaterEqual => json!(l >= r),
                OpCode::Equal => json!((l - r).abs() < EPSILON),
                OpCode::NotEqual => json!((l - r).abs() >= EPSILON),
                OpCode::In | OpCode::And | OpCode::Or => json!(false),
            })
        }
        (op, Value::String(a), Value::String(b)) => match op {
            OpCode::Equal => Ok(json!(a == b)),
            OpCode::Add => Ok(json!(format!("{}{}", a, b))),
            OpCode::In => Ok(json!(b.contains(&a))),
            OpCode::Less => Ok(json!(a < b)),
            OpCode::Greater => Ok(json!(a > b)),
            OpCode::LessEqual => Ok(json!(a <= b)),
            OpCode::GreaterEqual => Ok(json!(a >= b)),
            _ => Err(format!("invalid operation {} on {:?} and {:?}", op, a, b)),
        },
        (OpCode::In, left, Value::Array(items)) => Ok(json!(items.contains(&left))),
        (OpCode::In, Value::String(key), Value::Object(map)) => Ok(json!(map.contains_key(&key))),
        (OpCode::Equal, a, b) => Ok(json!(match (a, b) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        })),
        (op, left, right) => Err(format!("invalid operation {} on {} and {}", op, left, right)),
    }
}

fn transform(name: &str, args: &[Value]) -> WalkResult {
    match name {
        "lower" => Ok(json!(subject_str(args).to_lowercase())),
        "upper" => Ok(json!(subject_str(args).to_uppercase())),
        "trim" => Ok(json!(subject_str(args).trim())),
        "length" => {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len))
        }
        other => Err(format!("unknown transform: {}", other)),
    }
}

fn subject_str(args: &[Value]) -> String {
    match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// A compiled boolean predicate.
#[derive(Clone)]
pub struct BoolProgram {
    parsed: Parsed,
}

impl BoolProgram {
    /// Expression text
    pub fn source(&self) -> &str {
        &self.parsed.source
    }

    /// Evaluate against state and input views.
    pub fn eval(&self, state: &Value, input: &Value) -> Result<bool> {
        Ok(is_truthy(&self.parsed.eval(state, input)?))
    }
}

impl fmt::Debug for BoolProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoolProgram").field(&self.parsed.source).finish()
    }
}

impl PartialEq for BoolProgram {
    fn eq(&self, other: &Self) -> bool {
        self.parsed.source == other.parsed.source
    }
}

impl Eq for BoolProgram {}

/// Compile a boolean predicate.
pub fn compile_bool(expr: &str) -> Result<BoolProgram> {
    Ok(BoolProgram { parsed: Parsed::new(expr)? })
}

/// A compiled value-producing expression.
#[derive(Clone)]
pub struct ValueProgram {
    parsed: Parsed,
}

impl ValueProgram {
    /// Expression text
    pub fn source(&self) -> &str {
        &self.parsed.source
    }

    /// Evaluate against state and input views.
    pub fn eval(&self, state: &Value, input: &Value) -> Result<Value> {
        self.parsed.eval(state, input)
    }
}

impl fmt::Debug for ValueProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValueProgram").field(&self.parsed.source).finish()
    }
}

impl PartialEq for ValueProgram {
    fn eq(&self, other: &Self) -> bool {
        self.parsed.source == other.parsed.source
    }
}

impl Eq for ValueProgram {}

/// Compile a value expression.
pub fn compile(expr: &str) -> Result<ValueProgram> {
    Ok(ValueProgram { parsed: Parsed::new(expr)? })
}

/// One-shot evaluation.
pub fn eval(expr: &str, state: &Value, input: &Value) -> Result<Value> {
    Parsed::new(expr)?.eval(state, input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_evaluates_predicates() {
        let program = compile_bool("state.counter < 3").unwrap();
        assert!(program.eval(&json!({"counter": 1}), &json!({})).unwrap());
        assert!(!program.eval(&json!({"counter": 5}), &json!({})).unwrap());
    }

    #[test]
    fn predicate_reads_input_view() {
        let program = compile_bool("input.output_parsed.ok == true").unwrap();
        let input = json!({"output_parsed": {"ok": true}});
        assert!(program.eval(&json!({}), &input).unwrap());
    }

    #[test]
    fn syntax_errors_surface_at_compile_time() {
        assert!(matches!(compile_bool("state.x ==").unwrap_err(), CoreError::ExpressionError(_)));
        assert!(compile_bool("  ").is_err());
    }

    #[test]
    fn value_expressions() {
        let v = eval("state.name|upper", &json!({"name": "ada"}), &json!({})).unwrap();
        assert_eq!(v, json!("ADA"));
        let v = eval("state.items|length", &json!({"items": [1, 2, 3]}), &json!({})).unwrap();
        assert_eq!(v, json!(3));
    }

    #[test]
    fn compiled_program_is_reused_across_evaluations() {
        let program = compile_bool("state.n > 2 && input.tag in ['a', 'b']").unwrap();
        let copy = program.clone();
        assert!(Arc::ptr_eq(&program.parsed.tree, &copy.parsed.tree));
        for n in 0..5 {
            assert_eq!(copy.eval(&json!({"n": n}), &json!({"tag": "a"})).unwrap(), n > 2);
        }
        assert!(!program.eval(&json!({"n": 9}), &json!({"tag": "z"})).unwrap());
        assert_eq!(program.source(), "state.n > 2 && input.tag in ['a', 'b']");
    }

    #[test]
    fn operators_and_lookups() {
        let state = json!({"items": [{"k": 1}, {"k": 5}], "m": {"x": "y"}});
        assert_eq!(eval("state.items[.k > 2]", &state, &json!({})).unwrap(), json!([{"k": 5}]));
        assert_eq!(eval("state.items[1].k", &state, &json!({})).unwrap(), json!(5));
        assert_eq!(eval("state.m['x'] + '!'", &state, &json!({})).unwrap(), json!("y!"));
        assert_eq!(eval("'x' in state.m", &state, &json!({})).unwrap(), json!(true));
        assert_eq!(eval("state.missing ? 1 : 2", &state, &json!({})).unwrap(), json!(2.0));
        assert_eq!(eval("7 // 2", &state, &json!({})).unwrap(), json!(3.0));
        assert_eq!(eval("state.missing || 'fallback'", &state, &json!({})).unwrap(), json!("fallback"));
    }

    #[test]
    fn runtime_errors_name_the_expression() {
        let err = eval("other.x", &json!({}), &json!({})).unwrap_err();
        assert!(err.to_string().contains("other.x"), "{}", err);
        assert!(eval("state.x|nope", &json!({"x": 1}), &json!({})).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("")));
        assert!(is_truthy(&json!(0)));
    }
}
