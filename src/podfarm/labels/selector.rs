/*
 * Copyright (C) 2025 The Podfarm Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Label selector expressions: equality (`=`, `==`, `!=`), set membership
//! (`in`, `notin`) and existence (`key`, `!key`) requirements joined by
//! commas, following the Kubernetes label-selector grammar. An empty
//! expression selects everything.

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabelRequirement {
    key: String,
    operator: LabelOperator,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LabelOperator {
    Equals(String),
    NotEquals(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Exists,
    NotExists,
}

impl LabelRequirement {
    fn new(key: impl Into<String>, operator: LabelOperator) -> Self {
        Self {
            key: key.into(),
            operator,
        }
    }

    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let actual = labels.get(&self.key);
        match &self.operator {
            LabelOperator::Equals(expected) => actual == Some(expected),
            LabelOperator::NotEquals(expected) => actual != Some(expected),
            LabelOperator::In(allowed) => actual
                .map(|value| allowed.iter().any(|candidate| candidate == value))
                .unwrap_or(false),
            LabelOperator::NotIn(disallowed) => actual
                .map(|value| !disallowed.iter().any(|candidate| candidate == value))
                .unwrap_or(true),
            LabelOperator::Exists => actual.is_some(),
            LabelOperator::NotExists => actual.is_none(),
        }
    }
}

impl Display for LabelRequirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.operator {
            LabelOperator::Equals(value) => write!(f, "{}={}", self.key, value),
            LabelOperator::NotEquals(value) => write!(f, "{}!={}", self.key, value),
            LabelOperator::In(values) => write!(f, "{} in ({})", self.key, values.join(",")),
            LabelOperator::NotIn(values) => write!(f, "{} notin ({})", self.key, values.join(",")),
            LabelOperator::Exists => write!(f, "{}", self.key),
            LabelOperator::NotExists => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of label requirements. `everything()` matches any label set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        LabelSelector::default()
    }

    pub fn and_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(LabelRequirement::new(key, LabelOperator::Equals(value.into())));
        self
    }

    pub fn and_not_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(LabelRequirement::new(
            key,
            LabelOperator::NotEquals(value.into()),
        ));
        self
    }

    pub fn and_in(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.requirements
            .push(LabelRequirement::new(key, LabelOperator::In(values)));
        self
    }

    pub fn and_not_in(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.requirements
            .push(LabelRequirement::new(key, LabelOperator::NotIn(values)));
        self
    }

    pub fn and_exists(mut self, key: impl Into<String>) -> Self {
        self.requirements
            .push(LabelRequirement::new(key, LabelOperator::Exists));
        self
    }

    pub fn and_not_exists(mut self, key: impl Into<String>) -> Self {
        self.requirements
            .push(LabelRequirement::new(key, LabelOperator::NotExists));
        self
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }

    pub fn parse(raw: &str) -> Result<Self, SelectorParseError> {
        let mut requirements = Vec::new();
        for expr in split_selector_terms(raw) {
            requirements.push(parse_requirement(expr)?);
        }
        Ok(LabelSelector { requirements })
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .requirements
            .iter()
            .map(|requirement| requirement.to_string())
            .collect();
        f.write_str(&rendered.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        LabelSelector::parse(raw)
    }
}

#[derive(Debug)]
pub struct SelectorParseError(String);

impl SelectorParseError {
    fn new(message: impl Into<String>) -> Self {
        SelectorParseError(message.into())
    }
}

impl Display for SelectorParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported selector expression: {}", self.0)
    }
}

impl Error for SelectorParseError {}

fn parse_requirement(expr: &str) -> Result<LabelRequirement, SelectorParseError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(SelectorParseError::new("empty requirement"));
    }

    if let Some(rest) = trimmed.strip_prefix('!') {
        let key = rest.trim();
        if key.is_empty() {
            return Err(SelectorParseError::new(format!("'{}'; missing key", expr)));
        }
        return Ok(LabelRequirement::new(key, LabelOperator::NotExists));
    }

    if let Some(requirement) = parse_set_requirement(trimmed)? {
        return Ok(requirement);
    }

    if let Some((operator, left, right)) = parse_equality(trimmed) {
        let key = left.trim();
        if key.is_empty() {
            return Err(SelectorParseError::new(format!("'{}'; missing key", expr)));
        }
        let value = right.trim().to_string();
        return Ok(match operator {
            EqualityOperator::Equals => {
                LabelRequirement::new(key, LabelOperator::Equals(value))
            }
            EqualityOperator::NotEquals => {
                LabelRequirement::new(key, LabelOperator::NotEquals(value))
            }
        });
    }

    if trimmed.contains(' ') {
        return Err(SelectorParseError::new(format!(
            "'{}'; expected operator",
            expr
        )));
    }

    Ok(LabelRequirement::new(trimmed, LabelOperator::Exists))
}

fn parse_set_requirement(
    expr: &str,
) -> Result<Option<LabelRequirement>, SelectorParseError> {
    let Some(start) = expr.find('(') else {
        return Ok(None);
    };

    let Some(end) = expr.rfind(')') else {
        return Err(SelectorParseError::new(format!(
            "'{}'; missing closing ')'",
            expr
        )));
    };

    if end < start || !expr[end + 1..].trim().is_empty() {
        return Err(SelectorParseError::new(format!(
            "'{}'; mismatched parentheses",
            expr
        )));
    }

    let head = expr[..start].trim();
    let mut parts = head.split_whitespace().collect::<Vec<_>>();
    if parts.len() != 2 {
        return Err(SelectorParseError::new(format!(
            "'{}'; expected '<key> <operator> (...)'",
            expr
        )));
    }

    let key = parts.remove(0);
    let operator = parts.remove(0);
    let values: Vec<String> = split_selector_terms(&expr[start + 1..end])
        .map(|value| value.trim().to_string())
        .collect();
    if values.is_empty() {
        return Err(SelectorParseError::new(format!("'{}'; empty set", expr)));
    }

    let requirement = match operator {
        "in" => LabelRequirement::new(key, LabelOperator::In(values)),
        "notin" => LabelRequirement::new(key, LabelOperator::NotIn(values)),
        _ => {
            return Err(SelectorParseError::new(format!(
                "'{}'; unknown set operator '{}'",
                expr, operator
            )))
        }
    };

    Ok(Some(requirement))
}

fn split_selector_terms(raw: &str) -> impl Iterator<Item = &str> {
    let mut terms = Vec::new();
    let mut start = 0;
    let mut depth = 0;
    for (idx, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            ',' if depth == 0 => {
                let slice = raw[start..idx].trim();
                if !slice.is_empty() {
                    terms.push(slice);
                }
                start = idx + 1;
            }
            _ => {}
        }
    }

    let slice = raw[start..].trim();
    if !slice.is_empty() {
        terms.push(slice);
    }

    terms.into_iter()
}

#[derive(Clone, Copy)]
enum EqualityOperator {
    Equals,
    NotEquals,
}

fn parse_equality(expr: &str) -> Option<(EqualityOperator, &str, &str)> {
    if let Some((left, right)) = expr.split_once("!=") {
        return Some((EqualityOperator::NotEquals, left, right));
    }
    if let Some((left, right)) = expr.split_once("==") {
        return Some((EqualityOperator::Equals, left, right));
    }
    expr.split_once('=')
        .map(|(left, right)| (EqualityOperator::Equals, left, right))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn everything_matches_any_label_set() {
        let selector = LabelSelector::everything();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("az", "az1")])));
    }

    #[test]
    fn equality_requirements() {
        let selector = LabelSelector::everything().and_equals("az", "az1");
        assert!(selector.matches(&labels(&[("az", "az1")])));
        assert!(!selector.matches(&labels(&[("az", "az2")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn inequality_matches_missing_and_different() {
        let selector = LabelSelector::parse("env!=prod").expect("parse");
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("env", "staging")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn set_and_existence_requirements() {
        let selector =
            LabelSelector::parse("app in (web,api),tier notin (backend),track").expect("parse");
        assert!(selector.matches(&labels(&[
            ("app", "api"),
            ("tier", "frontend"),
            ("track", "stable"),
        ])));
        assert!(!selector.matches(&labels(&[
            ("app", "worker"),
            ("tier", "frontend"),
            ("track", "stable"),
        ])));
        assert!(!selector.matches(&labels(&[
            ("app", "api"),
            ("tier", "backend"),
            ("track", "stable"),
        ])));
        assert!(!selector.matches(&labels(&[("app", "api"), ("tier", "frontend")])));
    }

    #[test]
    fn not_exists_requirement() {
        let selector = LabelSelector::parse("!debug").expect("parse");
        assert!(selector.matches(&labels(&[("app", "api")])));
        assert!(!selector.matches(&labels(&[("debug", "true")])));
    }

    #[test]
    fn empty_expression_selects_everything() {
        let selector = LabelSelector::parse("").expect("parse");
        assert!(selector.is_everything());
    }

    #[test]
    fn display_round_trips() {
        for raw in [
            "az=az1",
            "env!=prod",
            "app in (web,api)",
            "tier notin (backend)",
            "track",
            "!debug",
            "az=az1,app in (web,api),!debug",
        ] {
            let selector = LabelSelector::parse(raw).expect("parse");
            let reparsed =
                LabelSelector::parse(&selector.to_string()).expect("reparse rendered form");
            assert_eq!(selector, reparsed, "round trip failed for '{raw}'");
        }
    }

    #[test]
    fn builder_and_parser_agree() {
        let built = LabelSelector::everything()
            .and_equals("az", "az1")
            .and_in("app", vec!["web".to_string(), "api".to_string()]);
        let parsed = LabelSelector::parse("az=az1,app in (web,api)").expect("parse");
        assert_eq!(built, parsed);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        assert!(LabelSelector::parse("app ~~ web").is_err());
        assert!(LabelSelector::parse("app in ()").is_err());
        assert!(LabelSelector::parse("app foo (a)").is_err());
        assert!(LabelSelector::parse("!").is_err());
    }
}
