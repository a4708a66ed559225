use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Request rules deciding which requests skip authentication.
///
/// Rules are evaluated in the order they are declared; the first rule whose
/// expression matches decides the action. Requests matching no rule get
/// `default_action`.
///
/// ```toml
/// [rules]
/// default_action = "auth"
/// syntax = "pattern"
/// pass_through = ["/metrics"]
///
/// [[rules.rule]]
/// name = "public"
/// action = "allow"
/// rule = "PathPrefix(`/healthz`)"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Action for requests no rule matches.
    #[serde(default)]
    pub default_action: RuleAction,

    /// Which expression grammar the rules are written in.
    #[serde(default)]
    pub syntax: RuleSyntax,

    /// Literal path prefixes that are always allowed, checked before any rule.
    #[serde(default)]
    pub pass_through: Vec<String>,

    /// Rule definitions in evaluation order.
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

impl RulesConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::Validation("rule name cannot be empty".into()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }
        for prefix in &self.pass_through {
            if !prefix.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "pass-through prefix '{prefix}' must start with '/'"
                )));
            }
        }
        Ok(())
    }
}

/// One named rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Unique rule name, used in logs.
    pub name: String,

    /// What to do when the rule matches.
    #[serde(default)]
    pub action: RuleAction,

    /// Match expression in the configured syntax.
    pub rule: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Require an authenticated session.
    #[default]
    Auth,
    /// Let the request through without a session.
    Allow,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Auth => write!(f, "auth"),
            RuleAction::Allow => write!(f, "allow"),
        }
    }
}

/// Rule expression grammar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSyntax {
    /// `Host:a.com,b.com;PathPrefix:/api` clauses.
    #[default]
    Legacy,
    /// Router-style `Host(`a.com`) && PathPrefix(`/api`)` expressions.
    Pattern,
}
