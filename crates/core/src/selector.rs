//! Kubernetes label selectors: parse the `kubectl -l` syntax, render it back
//! for list calls, and match label sets in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub op: Operator,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let v = labels.get(&self.key);
        match &self.op {
            Operator::Equals(want) => v == Some(want),
            Operator::NotEquals(want) => v != Some(want),
            Operator::In(set) => v.is_some_and(|v| set.contains(v)),
            Operator::NotIn(set) => v.map_or(true, |v| !set.contains(v)),
            Operator::Exists => v.is_some(),
            Operator::DoesNotExist => v.is_none(),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }

    pub fn from_match_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let requirements = labels
            .into_iter()
            .map(|(k, v)| Requirement { key: k.into(), op: Operator::Equals(v.into()) })
            .collect();
        Self { requirements }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn valid_token(s: &str) -> bool {
    !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || "=!(),".contains(c))
}

fn parse_term(term: &str) -> Result<Requirement, String> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if !valid_token(key) { return Err(format!("invalid key in {term:?}")); }
        return Ok(Requirement { key: key.into(), op: Operator::DoesNotExist });
    }
    if let Some(open) = term.find('(') {
        let inner = term[open + 1..].strip_suffix(')').ok_or_else(|| format!("unclosed value list in {term:?}"))?;
        let mut head = term[..open].split_whitespace();
        let key = head.next().ok_or_else(|| format!("missing key in {term:?}"))?;
        let set_op = head.next().ok_or_else(|| format!("missing operator in {term:?}"))?;
        if head.next().is_some() || !valid_token(key) { return Err(format!("malformed set expression {term:?}")); }
        let values: BTreeSet<String> = inner.split(',').map(|v| v.trim()).filter(|v| !v.is_empty()).map(String::from).collect();
        if values.is_empty() { return Err(format!("empty value list in {term:?}")); }
        let op = match set_op {
            "in" => Operator::In(values),
            "notin" => Operator::NotIn(values),
            other => return Err(format!("unknown set operator {other:?}")),
        };
        return Ok(Requirement { key: key.into(), op });
    }
    let (key, op) = if let Some((k, v)) = term.split_once("!=") {
        (k, Operator::NotEquals(v.trim().into()))
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Operator::Equals(v.trim().into()))
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Operator::Equals(v.trim().into()))
    } else {
        (term, Operator::Exists)
    };
    let key = key.trim();
    if !valid_token(key) { return Err(format!("invalid key in {term:?}")); }
    if let Operator::Equals(v) | Operator::NotEquals(v) = &op {
        if !v.is_empty() && !valid_token(v) { return Err(format!("invalid value in {term:?}")); }
    }
    Ok(Requirement { key: key.into(), op })
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() { return Ok(Self::everything()); }
        let requirements = split_terms(s)
            .into_iter()
            .map(|t| parse_term(t.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| Error::Selector { input: s.to_string(), reason })?;
        Ok(Self { requirements })
    }
}

fn join(set: &BTreeSet<String>) -> String { set.iter().map(String::as_str).collect::<Vec<_>>().join(",") }

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = &self.key;
        match &self.op {
            Operator::Equals(v) => write!(f, "{k}={v}"),
            Operator::NotEquals(v) => write!(f, "{k}!={v}"),
            Operator::In(set) => write!(f, "{k} in ({})", join(set)),
            Operator::NotIn(set) => write!(f, "{k} notin ({})", join(set)),
            Operator::Exists => write!(f, "{k}"),
            Operator::DoesNotExist => write!(f, "!{k}"),
        }
    }
}

/// Renders the form accepted by the API server's `labelSelector` parameter.
impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}
