//! Canonical rule-group form shared by the CRD loader and the ruler client.
//!
//! The shape follows the Prometheus rule file format. Values are normalized on
//! decode (durations re-rendered, empty maps dropped, zero durations omitted)
//! so that derived `PartialEq` is the structural comparison used for diffs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Rule groups keyed by ruler namespace.
pub type RuleGroupsByNamespace = BTreeMap<String, Vec<RuleGroup>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub name: String,
    #[serde(default, deserialize_with = "nonzero_duration", skip_serializing_if = "Option::is_none")]
    pub interval: Option<PromDuration>,
    #[serde(default, deserialize_with = "nonzero_duration", skip_serializing_if = "Option::is_none")]
    pub query_offset: Option<PromDuration>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "is_zero")]
    pub limit: u32,
    /// Added to every rule in the group; rule labels win on conflict.
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "nullable")]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(deserialize_with = "int_or_string")]
    pub expr: String,
    #[serde(rename = "for", default, deserialize_with = "nonzero_duration", skip_serializing_if = "Option::is_none")]
    pub for_: Option<PromDuration>,
    #[serde(default, deserialize_with = "nonzero_duration", skip_serializing_if = "Option::is_none")]
    pub keep_firing_for: Option<PromDuration>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    pub fn alerting(alert: &str, expr: &str) -> Self { Self { alert: Some(alert.into()), ..Self::bare(expr) } }

    pub fn recording(record: &str, expr: &str) -> Self { Self { record: Some(record.into()), ..Self::bare(expr) } }

    fn bare(expr: &str) -> Self {
        Self {
            record: None,
            alert: None,
            expr: expr.into(),
            for_: None,
            keep_firing_for: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Name of the alert or recorded series.
    pub fn name(&self) -> &str { self.alert.as_deref().or(self.record.as_deref()).unwrap_or("") }
}

/// Top-level document of the rule format: `groups: [...]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroups {
    #[serde(default, deserialize_with = "nullable")]
    pub groups: Vec<RuleGroup>,
}

/// Parse a rule document and check that it is structurally usable.
/// Queries are not validated; the ruler dialect differs from PromQL.
pub fn parse_rule_groups(yaml: &str) -> Result<Vec<RuleGroup>, Error> {
    let doc: RuleGroups = serde_yaml::from_str(yaml)?;
    validate(&doc.groups)?;
    Ok(doc.groups)
}

/// Convert a `PrometheusRule` spec by re-encoding it and decoding through the rule format.
pub fn rule_groups_from_spec(spec: &serde_json::Value) -> Result<Vec<RuleGroup>, Error> {
    let yaml = serde_yaml::to_string(spec)?;
    parse_rule_groups(&yaml)
}

fn validate(groups: &[RuleGroup]) -> Result<(), Error> {
    let mut seen = BTreeSet::new();
    for g in groups {
        if g.name.is_empty() {
            return Err(Error::InvalidGroup("group name must not be empty".into()));
        }
        if !seen.insert(g.name.as_str()) {
            return Err(Error::InvalidGroup(format!("{}: repeated in the same resource", g.name)));
        }
        for (i, r) in g.rules.iter().enumerate() {
            match (&r.record, &r.alert) {
                (Some(_), Some(_)) => {
                    return Err(Error::InvalidGroup(format!("{}: rule {}: only one of 'record' or 'alert' may be set", g.name, i)))
                }
                (None, None) => {
                    return Err(Error::InvalidGroup(format!("{}: rule {}: one of 'record' or 'alert' must be set", g.name, i)))
                }
                _ => {}
            }
            if r.expr.trim().is_empty() {
                return Err(Error::InvalidGroup(format!("{}: rule {}: 'expr' must be set", g.name, i)));
            }
        }
    }
    Ok(())
}

const SECOND: u64 = 1000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Units in the only order the format accepts them. `exact` units are only
/// rendered when they divide the remainder.
const UNITS: [(&str, u64, bool); 7] = [
    ("y", 365 * DAY, true),
    ("w", 7 * DAY, true),
    ("d", DAY, false),
    ("h", HOUR, false),
    ("m", MINUTE, false),
    ("s", SECOND, false),
    ("ms", 1, false),
];

/// Prometheus-style duration (`1h30m`, `90s`, `2w`) with millisecond precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PromDuration(u64);

impl PromDuration {
    pub const fn from_millis(ms: u64) -> Self { Self(ms) }
    pub const fn as_millis(&self) -> u64 { self.0 }
    pub const fn is_zero(&self) -> bool { self.0 == 0 }
}

impl From<PromDuration> for Duration {
    fn from(d: PromDuration) -> Self { Duration::from_millis(d.0) }
}

impl FromStr for PromDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::Duration(s.to_string());
        if s == "0" { return Ok(Self(0)); }
        if s.is_empty() { return Err(bad()); }
        let bytes = s.as_bytes();
        let mut i = 0;
        let mut last_unit: Option<usize> = None;
        let mut total: u64 = 0;
        while i < bytes.len() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() { i += 1; }
            if start == i { return Err(bad()); }
            let n: u64 = s[start..i].parse().map_err(|_| bad())?;
            let rest = &s[i..];
            // "ms" must win over "m"
            let (idx, (unit, mult, _)) = UNITS
                .iter()
                .enumerate()
                .filter(|(_, (u, _, _))| rest.starts_with(u))
                .max_by_key(|(_, (u, _, _))| u.len())
                .ok_or_else(bad)?;
            if last_unit.is_some_and(|l| idx <= l) { return Err(bad()); }
            last_unit = Some(idx);
            i += unit.len();
            total = n.checked_mul(*mult).and_then(|v| total.checked_add(v)).ok_or_else(bad)?;
        }
        Ok(Self(total))
    }
}

impl fmt::Display for PromDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ms = self.0;
        if ms == 0 { return f.write_str("0s"); }
        for (unit, mult, exact) in UNITS {
            if exact && ms % mult != 0 { continue; }
            let v = ms / mult;
            if v > 0 {
                write!(f, "{}{}", v, unit)?;
                ms -= v * mult;
            }
        }
        Ok(())
    }
}

impl Serialize for PromDuration {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { s.collect_str(self) }
}

impl<'de> Deserialize<'de> for PromDuration {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn is_zero(v: &u32) -> bool { *v == 0 }

fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn nonzero_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PromDuration>, D::Error> {
    Ok(Option::<PromDuration>::deserialize(d)?.filter(|v| !v.is_zero()))
}

fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }
    Ok(match IntOrString::deserialize(d)? {
        IntOrString::Int(i) => i.to_string(),
        IntOrString::Str(s) => s,
    })
}
