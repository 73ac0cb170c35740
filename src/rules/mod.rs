//! Declarative post-processing rules.
//!
//! Rules are TOML documents (one per file) compiled at startup into an
//! executable predicate plus a list of action items. Operators are resolved
//! through an explicit registry; there is no runtime discovery.

mod actions;
mod context;
mod engine;
mod loader;
mod registry;

pub use actions::{ActionItem, Offset, TimeUnit};
pub use context::{element_str, tag_for_keyword, RuleContext};
pub use engine::RulesEngine;
pub use loader::{compile_rule, load_rules_dir, RawAction, RawCondition, RawRule, Rule};
pub use registry::{OperatorFactory, OperatorRegistry, Predicate};

use thiserror::Error;

/// Rule-document schema or compilation error. Raised at load time and
/// propagated directly: a bad rule file is a configuration defect, not a
/// retryable condition.
#[derive(Debug, Error)]
pub enum RuleCompileError {
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rule document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),

    #[error("unknown time unit '{0}'")]
    UnknownTimeUnit(String),

    #[error("rule '{rule}': {message}")]
    Invalid { rule: String, message: String },
}

/// Events a rule can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    SopProcessed,
    StudyProcessed,
    StudyArchived,
}

impl Trigger {
    pub fn parse(raw: &str) -> Result<Self, RuleCompileError> {
        match raw {
            "sop-processed" => Ok(Trigger::SopProcessed),
            "study-processed" => Ok(Trigger::StudyProcessed),
            "study-archived" => Ok(Trigger::StudyArchived),
            other => Err(RuleCompileError::UnknownTrigger(other.to_string())),
        }
    }
}
