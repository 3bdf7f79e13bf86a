//! Task rules
//!
//! A rule is a named boolean finding recorded against a running task. Any
//! rule with `failed = true` forces the task's terminal status to
//! `Rule Broken` when the task completes.

use serde::{Deserialize, Serialize};

/// A named boolean finding recorded against a running task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRule {
    pub name: String,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskRule {
    /// A rule that passed
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failed: false,
            message: None,
        }
    }

    /// A rule that failed, with an explanatory message
    pub fn broken(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failed: true,
            message: Some(message.into()),
        }
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::BlankName);
        }
        Ok(())
    }
}

/// Validate a rules array: valid when null or a non-empty array of valid rules
pub fn validate_rules(rules: Option<&[TaskRule]>) -> Result<(), RuleError> {
    match rules {
        None => Ok(()),
        Some([]) => Err(RuleError::EmptyArray),
        Some(rules) => {
            for rule in rules {
                rule.validate()?;
            }
            Ok(())
        }
    }
}

/// True when any rule in the array failed
pub fn any_rule_failed(rules: Option<&[TaskRule]>) -> bool {
    rules
        .map(|rules| rules.iter().any(|r| r.failed))
        .unwrap_or(false)
}

/// Rule validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule name must not be blank")]
    BlankName,

    #[error("rules array must be null or non-empty")]
    EmptyArray,
}
