//! Policy engine: ordered deny rules evaluated before execution.
//!
//! Rules are checked in declaration order against `(module, host,
//! environment, params)`; the first matching deny wins and no later rule
//! can override it. No match means allow, and an empty policy always
//! allows. Evaluation happens after the replay check and before secret
//! injection, so decisions never see secret values.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{EngineError, Result};

/// One rule: a decision plus the clauses that must all match.
///
/// Clause keys: `module` (glob vs FQCN), `host` (glob vs host name),
/// `environment` (equality vs the context environment), `param.<k>`
/// (glob vs the stringified parameter value).
#[derive(Clone, Debug, Deserialize)]
pub struct PolicyRule {
    pub decision: String,
    #[serde(default, rename = "match")]
    pub match_on: BTreeMap<String, String>,
    #[serde(default)]
    pub reason: String,
}

/// Outcome of an evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

#[derive(Clone, Debug, Default)]
pub struct Policy {
    rules: Vec<PolicyRule>,
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

impl Policy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// A policy with no rules; permits everything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(content)
            .map_err(|e| EngineError::InventoryInvalid(format!("policy: {e}")))?;
        Ok(Self::new(file.rules))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// First matching deny wins; otherwise allow.
    pub fn evaluate(
        &self,
        module: &str,
        host: &str,
        environment: &str,
        params: &Value,
    ) -> Decision {
        for rule in &self.rules {
            if rule.decision != "deny" {
                continue;
            }
            if rule_matches(rule, module, host, environment, params) {
                tracing::debug!(module, host, reason = %rule.reason, "policy denied");
                return Decision::Deny(rule.reason.clone());
            }
        }
        Decision::Allow
    }
}

/// All stated clauses must match. An unknown clause key makes the rule
/// non-matching so a typo in a deny rule cannot silently widen it into a
/// match-all.
fn rule_matches(
    rule: &PolicyRule,
    module: &str,
    host: &str,
    environment: &str,
    params: &Value,
) -> bool {
    for (key, pattern) in &rule.match_on {
        let matched = match key.as_str() {
            "module" => glob_match(pattern, module),
            "host" => glob_match(pattern, host),
            "environment" => pattern == environment,
            _ => match key.strip_prefix("param.") {
                Some(param_name) => {
                    let value = params
                        .get(param_name)
                        .map(stringify_param)
                        .unwrap_or_default();
                    glob_match(pattern, &value)
                }
                None => return false,
            },
        };
        if !matched {
            return false;
        }
    }
    true
}

fn glob_match(pattern: &str, value: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => pattern == value,
    }
}

fn stringify_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
rules:
  - decision: deny
    match:
      module: shell
      environment: prod
    reason: use proper modules in production
  - decision: deny
    match:
      module: "amazon.aws.*"
      param.state: absent
    reason: no teardown through automation
  - decision: deny
    match:
      host: "db-*"
    reason: database hosts are frozen
"#;

    fn policy() -> Policy {
        Policy::from_yaml_str(POLICY_YAML).unwrap()
    }

    #[test]
    fn empty_policy_allows_everything() {
        let decision = Policy::empty().evaluate("shell", "h1", "prod", &Value::Null);
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn all_clauses_must_match() {
        let policy = policy();
        // module matches but environment does not.
        assert_eq!(
            policy.evaluate("shell", "web01", "staging", &serde_json::json!({})),
            Decision::Allow
        );
        assert_eq!(
            policy.evaluate("shell", "web01", "prod", &serde_json::json!({})),
            Decision::Deny("use proper modules in production".into())
        );
    }

    #[test]
    fn module_glob_and_param_clause() {
        let policy = policy();
        let params = serde_json::json!({"state": "absent", "name": "vm-1"});
        assert_eq!(
            policy.evaluate("amazon.aws.ec2", "web01", "", &params),
            Decision::Deny("no teardown through automation".into())
        );
        let present = serde_json::json!({"state": "present"});
        assert_eq!(
            policy.evaluate("amazon.aws.ec2", "web01", "", &present),
            Decision::Allow
        );
    }

    #[test]
    fn host_glob_clause() {
        let policy = policy();
        assert_eq!(
            policy.evaluate("ping", "db-primary", "", &serde_json::json!({})),
            Decision::Deny("database hosts are frozen".into())
        );
        assert_eq!(
            policy.evaluate("ping", "web01", "", &serde_json::json!({})),
            Decision::Allow
        );
    }

    #[test]
    fn first_matching_deny_wins() {
        let yaml = r#"
rules:
  - decision: deny
    match: {module: shell}
    reason: first
  - decision: deny
    match: {module: shell}
    reason: second
"#;
        let policy = Policy::from_yaml_str(yaml).unwrap();
        assert_eq!(
            policy.evaluate("shell", "h", "", &serde_json::json!({})),
            Decision::Deny("first".into())
        );
    }

    #[test]
    fn non_deny_rules_are_skipped() {
        let yaml = r#"
rules:
  - decision: allow
    match: {module: shell}
    reason: cannot override
  - decision: deny
    match: {module: shell}
    reason: denied anyway
"#;
        let policy = Policy::from_yaml_str(yaml).unwrap();
        assert_eq!(
            policy.evaluate("shell", "h", "", &serde_json::json!({})),
            Decision::Deny("denied anyway".into())
        );
    }

    #[test]
    fn unknown_clause_key_never_matches() {
        let yaml = r#"
rules:
  - decision: deny
    match: {modul: shell}
    reason: typo
"#;
        let policy = Policy::from_yaml_str(yaml).unwrap();
        assert_eq!(
            policy.evaluate("shell", "h", "", &serde_json::json!({})),
            Decision::Allow
        );
    }

    #[test]
    fn missing_param_compares_as_empty() {
        let yaml = r#"
rules:
  - decision: deny
    match: {param.cmd: "rm *"}
    reason: no rm
"#;
        let policy = Policy::from_yaml_str(yaml).unwrap();
        assert_eq!(
            policy.evaluate("shell", "h", "", &serde_json::json!({})),
            Decision::Allow
        );
        assert_eq!(
            policy.evaluate("shell", "h", "", &serde_json::json!({"cmd": "rm -rf /"})),
            Decision::Deny("no rm".into())
        );
    }

    #[test]
    fn numeric_params_compare_by_string_form() {
        let yaml = r#"
rules:
  - decision: deny
    match: {param.port: "22"}
    reason: not the ssh port
"#;
        let policy = Policy::from_yaml_str(yaml).unwrap();
        assert_eq!(
            policy.evaluate("firewall", "h", "", &serde_json::json!({"port": 22})),
            Decision::Deny("not the ssh port".into())
        );
    }
}
