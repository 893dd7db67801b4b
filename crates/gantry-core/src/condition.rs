//! Condition expression evaluation.
//!
//! Jobs may carry a boolean expression over the process environment that
//! gates their execution. The grammar is deliberately small: equality
//! (`==`) and inequality (`!=`) over literals and `$VAR` references,
//! combined with `&&` or `||`. Operator precedence is flat: an
//! expression is split on `&&` first if present, otherwise on `||`;
//! mixing both operators in one expression is not supported.

use std::sync::OnceLock;

use regex::Regex;

/// Characters permitted in a condition expression.
const CHARSET: &str = r#"^[\w\s\$"'=!&|]+$"#;

fn charset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(CHARSET).unwrap())
}

/// Evaluates condition expressions against an environment lookup.
///
/// The default lookup reads the process environment; tests inject their
/// own to stay deterministic.
pub struct ConditionEvaluator {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator {
    /// Create an evaluator backed by the process environment.
    pub fn new() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Create an evaluator with a custom variable lookup.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Whether the expression only uses the permitted character set.
    /// The empty expression is valid (and always true).
    pub fn is_valid(condition: &str) -> bool {
        condition.is_empty() || charset_pattern().is_match(condition)
    }

    /// Evaluate an expression. Empty expressions are true.
    pub fn evaluate(&self, condition: &str) -> bool {
        let condition = condition.trim();
        if condition.is_empty() {
            return true;
        }

        if condition.contains("&&") {
            condition.split("&&").all(|part| self.evaluate_clause(part))
        } else if condition.contains("||") {
            condition.split("||").any(|part| self.evaluate_clause(part))
        } else {
            self.evaluate_clause(condition)
        }
    }

    /// A single clause: comparison or standalone truthiness check.
    fn evaluate_clause(&self, clause: &str) -> bool {
        let clause = clause.trim();

        if let Some((left, right)) = clause.split_once("==") {
            return self.resolve(left) == self.resolve(right);
        }
        if let Some((left, right)) = clause.split_once("!=") {
            return self.resolve(left) != self.resolve(right);
        }

        // Standalone value: truthy unless empty, "false" or "0".
        let value = self.resolve(clause);
        !value.is_empty() && value != "false" && value != "0"
    }

    /// Resolve a side of a comparison: `$VAR` reference, quoted string
    /// or bareword. Missing variables resolve to the empty string.
    fn resolve(&self, value: &str) -> String {
        let value = value.trim();

        if let Some(name) = value.strip_prefix('$') {
            return (self.lookup)(name).unwrap_or_default();
        }

        for quote in ['"', '\''] {
            if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
                return value[1..value.len() - 1].to_string();
            }
        }

        value.to_string()
    }
}
