use crate::rules::loader::RawCondition;
use crate::rules::{RuleCompileError, RuleContext};
use std::collections::HashMap;

/// A compiled rule condition.
pub type Predicate = Box<dyn Fn(&RuleContext) -> bool + Send + Sync>;

/// Builds a predicate from a raw condition node, recursing through the
/// registry for nested conditions.
pub type OperatorFactory =
    fn(&RawCondition, &OperatorRegistry) -> Result<Predicate, RuleCompileError>;

/// Explicit mapping from operator name to its factory. Populated once at
/// startup; an operator not present here is a compile error.
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// The built-in comparison and boolean operators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("equal", equal_factory);
        registry.register("not-equal", not_equal_factory);
        registry.register("greater-than", greater_than_factory);
        registry.register("less-than", less_than_factory);
        registry.register("exists", exists_factory);
        registry.register("and", and_factory);
        registry.register("or", or_factory);
        registry.register("not", not_factory);
        registry
    }

    pub fn register(&mut self, name: &str, factory: OperatorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn compile(&self, raw: &RawCondition) -> Result<Predicate, RuleCompileError> {
        let factory = self
            .factories
            .get(&raw.op)
            .ok_or_else(|| RuleCompileError::UnknownOperator(raw.op.clone()))?;
        factory(raw, self)
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn required_field(raw: &RawCondition) -> Result<String, RuleCompileError> {
    raw.field.clone().ok_or_else(|| RuleCompileError::Invalid {
        rule: raw.op.clone(),
        message: "operator requires a 'field'".to_string(),
    })
}

fn required_value(raw: &RawCondition) -> Result<String, RuleCompileError> {
    let value = raw.value.as_ref().ok_or_else(|| RuleCompileError::Invalid {
        rule: raw.op.clone(),
        message: "operator requires a 'value'".to_string(),
    })?;
    Ok(toml_value_str(value))
}

/// Render a TOML scalar the way it would compare as a DICOM string.
fn toml_value_str(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compile_children(
    raw: &RawCondition,
    registry: &OperatorRegistry,
    at_least: usize,
) -> Result<Vec<Predicate>, RuleCompileError> {
    if raw.conditions.len() < at_least {
        return Err(RuleCompileError::Invalid {
            rule: raw.op.clone(),
            message: format!("operator requires at least {} nested conditions", at_least),
        });
    }
    raw.conditions.iter().map(|c| registry.compile(c)).collect()
}

fn equal_factory(
    raw: &RawCondition,
    _registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let field = required_field(raw)?;
    let value = required_value(raw)?;
    Ok(Box::new(move |ctx| {
        ctx.field(&field).map(|v| v == value).unwrap_or(false)
    }))
}

fn not_equal_factory(
    raw: &RawCondition,
    _registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let field = required_field(raw)?;
    let value = required_value(raw)?;
    Ok(Box::new(move |ctx| {
        ctx.field(&field).map(|v| v != value).unwrap_or(false)
    }))
}

fn numeric_cmp(lhs: &str, rhs: &str) -> Option<std::cmp::Ordering> {
    let lhs: f64 = lhs.trim().parse().ok()?;
    let rhs: f64 = rhs.trim().parse().ok()?;
    lhs.partial_cmp(&rhs)
}

fn greater_than_factory(
    raw: &RawCondition,
    _registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let field = required_field(raw)?;
    let value = required_value(raw)?;
    Ok(Box::new(move |ctx| {
        ctx.field(&field)
            .and_then(|v| numeric_cmp(&v, &value))
            .map(|ord| ord == std::cmp::Ordering::Greater)
            .unwrap_or(false)
    }))
}

fn less_than_factory(
    raw: &RawCondition,
    _registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let field = required_field(raw)?;
    let value = required_value(raw)?;
    Ok(Box::new(move |ctx| {
        ctx.field(&field)
            .and_then(|v| numeric_cmp(&v, &value))
            .map(|ord| ord == std::cmp::Ordering::Less)
            .unwrap_or(false)
    }))
}

fn exists_factory(
    raw: &RawCondition,
    _registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let field = required_field(raw)?;
    Ok(Box::new(move |ctx| ctx.field(&field).is_some()))
}

fn and_factory(
    raw: &RawCondition,
    registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let children = compile_children(raw, registry, 1)?;
    Ok(Box::new(move |ctx| children.iter().all(|p| p(ctx))))
}

fn or_factory(
    raw: &RawCondition,
    registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let children = compile_children(raw, registry, 1)?;
    Ok(Box::new(move |ctx| children.iter().any(|p| p(ctx))))
}

fn not_factory(
    raw: &RawCondition,
    registry: &OperatorRegistry,
) -> Result<Predicate, RuleCompileError> {
    let mut children = compile_children(raw, registry, 1)?;
    if children.len() != 1 {
        return Err(RuleCompileError::Invalid {
            rule: raw.op.clone(),
            message: "'not' takes exactly one nested condition".to_string(),
        });
    }
    let child = children.remove(0);
    Ok(Box::new(move |ctx| !child(ctx)))
}
