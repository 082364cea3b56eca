//! rulesync core types: events, rule groups, managed namespaces, diffs.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod diff;
pub mod error;
pub mod lister;
pub mod namespace;
pub mod rules;
pub mod selector;

pub use diff::{diff_rule_state, DiffKind, DiffSummary, RuleGroupDiff, RuleGroupDiffsByNamespace};
pub use error::{Error, MultiError};
pub use lister::{DeclaredRule, NamespaceRef, ResourceLister};
pub use namespace::{is_managed_namespace, namespace_for_rule, ManagedNamespace};
pub use rules::{PromDuration, Rule, RuleGroup, RuleGroupsByNamespace};
pub use selector::LabelSelector;

/// Type of a queued change notification.
///
/// `Other` carries event types raised by collaborators sharing the queue;
/// the controller has no handler for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ResourceChanged,
    SyncRuler,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ResourceChanged => "resource-changed",
            EventKind::SyncRuler => "sync-ruler",
            EventKind::Other(s) => s,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Queue item. `(kind, key)` is the identity used for dedup and retry counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// `namespace/name` of the changed object; empty for ruler syncs.
    pub key: String,
}

impl Event {
    pub fn new(kind: EventKind, key: impl Into<String>) -> Self { Self { kind, key: key.into() } }

    pub fn resource_changed(key: impl Into<String>) -> Self { Self::new(EventKind::ResourceChanged, key) }

    pub fn sync_ruler() -> Self { Self::new(EventKind::SyncRuler, "") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_identity_is_kind_and_key() {
        assert_eq!(Event::resource_changed("ns/a"), Event::resource_changed("ns/a"));
        assert_ne!(Event::resource_changed("ns/a"), Event::resource_changed("ns/b"));
        assert_ne!(Event::new(EventKind::SyncRuler, "ns/a"), Event::resource_changed("ns/a"));
        assert_eq!(Event::sync_ruler().kind.to_string(), "sync-ruler");
        assert_eq!(EventKind::Other("sync-mimir".into()).as_str(), "sync-mimir");
    }
}
