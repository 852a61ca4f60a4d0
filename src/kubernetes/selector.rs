// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Label and field selectors
//!
//! Label selectors use kube's `Selector`. They scope watches server-side
//! (the cache filter) and are matched in memory for cached lists. Caller
//! supplied strings are parsed here from the Kubernetes selector grammar:
//!
//! - `key=value`, `key==value`, `key!=value`
//! - `key in (a,b)`, `key notin (a,b)`
//! - `key` (exists), `!key` (does not exist)
//!
//! Expressions are comma-separated and ANDed together.
//!
//! Field selectors only support `=`/`==` and `!=`. The cache can answer
//! `metadata.name` and `metadata.namespace`; anything else needs the API server.

use std::collections::BTreeSet;

use kube::core::{Expression, Selector};

use super::error::{Error, Result};

/// Parse the Kubernetes label selector string form into a `Selector`
pub fn parse_label_selector(input: &str) -> Result<Selector> {
    split_top_level(input)
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            parse_expression(part).map_err(|reason| Error::InvalidSelector {
                selector: input.to_string(),
                reason,
            })
        })
        .collect()
}

/// Split on commas that are not inside a parenthesized value set
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_expression(part: &str) -> std::result::Result<Expression, String> {
    if let Some(key) = part.strip_prefix('!') {
        return Ok(Expression::DoesNotExist(valid_key(key.trim())?));
    }

    // Check != before = so "a!=b" is not read as key "a!"
    if let Some((key, value)) = part.split_once("!=") {
        return Ok(Expression::NotEqual(
            valid_key(key.trim())?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = part.split_once("==").or_else(|| part.split_once('=')) {
        return Ok(Expression::Equal(
            valid_key(key.trim())?,
            value.trim().to_string(),
        ));
    }

    let tokens: Vec<&str> = part.splitn(2, char::is_whitespace).collect();
    if tokens.len() == 1 {
        return Ok(Expression::Exists(valid_key(tokens[0])?));
    }

    let key = valid_key(tokens[0])?;
    let rest = tokens[1].trim_start();
    let (negated, set) = if let Some(set) = rest.strip_prefix("notin") {
        (true, set)
    } else if let Some(set) = rest.strip_prefix("in") {
        (false, set)
    } else {
        return Err(format!("unknown operator in '{}'", part));
    };

    let inner = set
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| format!("expected parenthesized values in '{}'", part))?;
    let values: BTreeSet<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(format!("empty value set in '{}'", part));
    }

    Ok(if negated {
        Expression::NotIn(key, values)
    } else {
        Expression::In(key, values)
    })
}

fn valid_key(key: &str) -> std::result::Result<String, String> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(format!("invalid label key '{}'", key));
    }
    Ok(key.to_string())
}

/// Field selector operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelectorOperator {
    Equals,
    NotEquals,
}

/// One `path=value` / `path!=value` field requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    /// Field path in Kubernetes notation (e.g., "metadata.name")
    pub path: String,
    pub operator: FieldSelectorOperator,
    pub value: String,
}

impl FieldSelector {
    /// Parse a comma-separated field selector string
    pub fn parse_all(input: &str) -> Result<Vec<FieldSelector>> {
        let mut selectors = Vec::new();
        for part in input.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (path, operator, value) = if let Some((p, v)) = part.split_once("!=") {
                (p, FieldSelectorOperator::NotEquals, v)
            } else if let Some((p, v)) = part.split_once("==").or_else(|| part.split_once('=')) {
                (p, FieldSelectorOperator::Equals, v)
            } else {
                return Err(Error::InvalidSelector {
                    selector: input.to_string(),
                    reason: format!("'{}' has no = or != operator", part),
                });
            };
            selectors.push(FieldSelector {
                path: path.trim().to_string(),
                operator,
                value: value.trim().to_string(),
            });
        }
        Ok(selectors)
    }

    /// Evaluate against a field value (None when the field is unset)
    pub fn matches(&self, actual: Option<&str>) -> bool {
        let actual = actual.unwrap_or("");
        match self.operator {
            FieldSelectorOperator::Equals => actual == self.value,
            FieldSelectorOperator::NotEquals => actual != self.value,
        }
    }

    /// Convert to Kubernetes field selector string format
    pub fn to_k8s_string(&self) -> String {
        match self.operator {
            FieldSelectorOperator::Equals => format!("{}={}", self.path, self.value),
            FieldSelectorOperator::NotEquals => format!("{}!={}", self.path, self.value),
        }
    }
}
