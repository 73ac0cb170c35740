use crate::command::CommandProcessor;
use crate::config::{QueueConfig, RulesConfig};
use crate::error::Result;
use crate::rules::{load_rules_dir, OperatorRegistry, Rule, RuleCompileError, RuleContext, Trigger};
use std::path::Path;
use tracing::{debug, info};

/// Holds the compiled rule set and evaluates it against processing events.
pub struct RulesEngine {
    rules: Vec<Rule>,
    known_devices: Vec<String>,
    known_groups: Vec<String>,
    max_retries: u32,
}

impl RulesEngine {
    /// Compile every rule document named by the configuration. A schema
    /// violation in any document fails startup.
    pub fn load(
        config: &RulesConfig,
        queue: &QueueConfig,
        registry: &OperatorRegistry,
    ) -> std::result::Result<Self, RuleCompileError> {
        let rules = match &config.rules_dir {
            Some(dir) => load_rules_dir(Path::new(dir), registry)?,
            None => Vec::new(),
        };
        info!("Loaded {} post-processing rules", rules.len());
        Ok(Self {
            rules,
            known_devices: config.known_devices.clone(),
            known_groups: config.known_groups.clone(),
            max_retries: queue.max_retries,
        })
    }

    /// Build an engine from already-compiled rules.
    pub fn from_rules(
        rules: Vec<Rule>,
        known_devices: Vec<String>,
        known_groups: Vec<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            rules,
            known_devices,
            known_groups,
            max_retries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate all rules attached to `trigger` and append the enqueue
    /// commands of every matching rule's actions to `processor`. Returns
    /// the number of actions scheduled; skipped actions (unknown device or
    /// group) are logged inside the action itself.
    pub fn apply(
        &self,
        trigger: Trigger,
        ctx: &RuleContext,
        processor: &mut CommandProcessor,
    ) -> Result<usize> {
        let mut scheduled = 0;
        for rule in self.rules.iter().filter(|r| r.trigger == trigger) {
            if !rule.matches(ctx) {
                continue;
            }
            debug!(
                "Rule '{}' matched study {}",
                rule.name, ctx.location.study_instance_uid
            );
            for action in &rule.actions {
                if action.schedule(
                    ctx,
                    &self.known_devices,
                    &self.known_groups,
                    self.max_retries,
                    processor,
                )? {
                    scheduled += 1;
                }
            }
        }
        Ok(scheduled)
    }
}
