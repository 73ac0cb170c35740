use crate::rules::actions::{ActionItem, Offset, TimeUnit};
use crate::rules::{OperatorRegistry, Predicate, RuleCompileError, Trigger};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Raw rule document as it appears on disk.
#[derive(Debug, Deserialize)]
pub struct RawRule {
    pub name: String,
    pub trigger: String,
    #[serde(default)]
    pub condition: Option<RawCondition>,
    #[serde(default)]
    pub actions: Vec<RawAction>,
}

/// Raw condition node. Boolean operators nest through `conditions`.
#[derive(Debug, Deserialize)]
pub struct RawCondition {
    pub op: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<toml::Value>,
    #[serde(default)]
    pub conditions: Vec<RawCondition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RawAction {
    AutoRoute {
        device: String,
        #[serde(default)]
        time: Option<i64>,
        #[serde(default)]
        unit: Option<String>,
        #[serde(default)]
        ref_value: Option<String>,
    },
    CompressLossless {
        codec: String,
        time: i64,
        unit: String,
        #[serde(default)]
        ref_value: Option<String>,
    },
    CompressLossy {
        codec: String,
        #[serde(default)]
        ratio: Option<f64>,
        #[serde(default)]
        quality: Option<u8>,
        time: i64,
        unit: String,
        #[serde(default)]
        ref_value: Option<String>,
    },
    GrantAccess {
        group: String,
    },
}

/// A compiled rule: trigger, predicate, action items.
pub struct Rule {
    pub name: String,
    pub trigger: Trigger,
    pub condition: Option<Predicate>,
    pub actions: Vec<ActionItem>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("condition", &self.condition.as_ref().map(|_| "<predicate>"))
            .field("actions", &self.actions)
            .finish()
    }
}

impl Rule {
    pub fn matches(&self, ctx: &crate::rules::RuleContext) -> bool {
        self.condition.as_ref().map(|p| p(ctx)).unwrap_or(true)
    }
}

fn offset(
    rule: &str,
    time: Option<i64>,
    unit: Option<&str>,
) -> Result<Option<Offset>, RuleCompileError> {
    match (time, unit) {
        (None, None) => Ok(None),
        (Some(time), Some(unit)) => Ok(Some(Offset {
            time,
            unit: TimeUnit::parse(unit)?,
        })),
        _ => Err(RuleCompileError::Invalid {
            rule: rule.to_string(),
            message: "'time' and 'unit' must be given together".to_string(),
        }),
    }
}

/// Compile one raw rule document against the operator registry.
pub fn compile_rule(raw: RawRule, registry: &OperatorRegistry) -> Result<Rule, RuleCompileError> {
    let trigger = Trigger::parse(&raw.trigger)?;
    if raw.actions.is_empty() {
        return Err(RuleCompileError::Invalid {
            rule: raw.name.clone(),
            message: "a rule needs at least one action".to_string(),
        });
    }

    let condition = raw
        .condition
        .as_ref()
        .map(|c| registry.compile(c))
        .transpose()?;

    let mut actions = Vec::with_capacity(raw.actions.len());
    for action in raw.actions {
        let item = match action {
            RawAction::AutoRoute {
                device,
                time,
                unit,
                ref_value,
            } => ActionItem::AutoRoute {
                device,
                offset: offset(&raw.name, time, unit.as_deref())?,
                ref_value,
            },
            RawAction::CompressLossless {
                codec,
                time,
                unit,
                ref_value,
            } => ActionItem::CompressLossless {
                codec,
                offset: offset(&raw.name, Some(time), Some(&unit))?,
                ref_value,
            },
            RawAction::CompressLossy {
                codec,
                ratio,
                quality,
                time,
                unit,
                ref_value,
            } => {
                if ratio.is_none() && quality.is_none() {
                    return Err(RuleCompileError::Invalid {
                        rule: raw.name.clone(),
                        message: "lossy compression needs a 'ratio' or a 'quality'".to_string(),
                    });
                }
                ActionItem::CompressLossy {
                    codec,
                    ratio,
                    quality,
                    offset: offset(&raw.name, Some(time), Some(&unit))?,
                    ref_value,
                }
            }
            RawAction::GrantAccess { group } => ActionItem::GrantAccess { group },
        };
        actions.push(item);
    }

    Ok(Rule {
        name: raw.name,
        trigger,
        condition,
        actions,
    })
}

/// Load and compile every `.toml` rule document in a directory.
pub fn load_rules_dir(dir: &Path, registry: &OperatorRegistry) -> Result<Vec<Rule>, RuleCompileError> {
    let mut rules = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    entries.sort();

    for path in entries {
        let data = std::fs::read_to_string(&path)?;
        let raw: RawRule = toml::from_str(&data)?;
        let rule = compile_rule(raw, registry)?;
        info!("Compiled rule '{}' from {}", rule.name, path.display());
        rules.push(rule);
    }
    Ok(rules)
}
