//! Ruler namespace identity for declared rule resources.
//!
//! Every `PrometheusRule` owns exactly one ruler namespace named
//! `<prefix>-<namespace>-<name>-<uid>`. Only namespaces of that shape are
//! treated as ours; everything else on the ruler belongs to other tools.

use uuid::Uuid;

const SEP: char = '-';
/// Length of a hyphenated UUID (8-4-4-4-12).
const UUID_LEN: usize = 36;

/// Ruler namespace for a rule resource.
pub fn namespace_for_rule(prefix: &str, namespace: &str, name: &str, uid: &str) -> String {
    format!("{prefix}{SEP}{namespace}{SEP}{name}{SEP}{uid}")
}

/// A ruler namespace that parsed as one this controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedNamespace<'a> {
    /// `<namespace>-<name>` of the owning resource. Both parts may contain
    /// the separator, so they are not split apart.
    pub owner: &'a str,
    pub uid: Uuid,
}

impl<'a> ManagedNamespace<'a> {
    /// Structural match against `<prefix>-<owner>-<uuid>`, where the owner
    /// holds at least one separator with text on both sides.
    pub fn parse(prefix: &str, namespace: &'a str) -> Option<Self> {
        let rest = namespace.strip_prefix(prefix)?.strip_prefix(SEP)?;
        let split = rest.len().checked_sub(UUID_LEN)?;
        let head = rest.get(..split)?;
        let uid_part = rest.get(split..)?;
        let owner = head.strip_suffix(SEP)?;
        let inner_sep = owner
            .char_indices()
            .any(|(i, c)| c == SEP && i > 0 && i + c.len_utf8() < owner.len());
        if !inner_sep {
            return None;
        }
        if !is_hyphenated_uuid(uid_part) {
            return None;
        }
        let uid = Uuid::try_parse(uid_part).ok()?;
        Some(Self { owner, uid })
    }
}

fn is_hyphenated_uuid(s: &str) -> bool {
    s.len() == UUID_LEN
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == SEP,
            _ => c.is_ascii_hexdigit(),
        })
}

/// True if the ruler namespace was created by this controller for `prefix`.
pub fn is_managed_namespace(prefix: &str, namespace: &str) -> bool {
    ManagedNamespace::parse(prefix, namespace).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "6f1c2d2e-8a3b-4b6e-9c1d-0123456789ab";

    #[test]
    fn generated_names_are_managed() {
        let ns = namespace_for_rule("rulesync", "monitoring", "api-alerts", UID);
        assert_eq!(ns, format!("rulesync-monitoring-api-alerts-{UID}"));
        let m = ManagedNamespace::parse("rulesync", &ns).unwrap();
        assert_eq!(m.owner, "monitoring-api-alerts");
        assert_eq!(m.uid.to_string(), UID);
    }

    #[test]
    fn uppercase_uuid_is_accepted() {
        let ns = format!("rulesync-a-b-{}", UID.to_uppercase());
        assert!(is_managed_namespace("rulesync", &ns));
    }

    #[test]
    fn foreign_namespaces_are_not_managed() {
        let cases = [
            "team-a".to_string(),
            format!("other-monitoring-rules-{UID}"),
            format!("rulesync-monitoring-{UID}"),
            format!("rulesync--rules-{UID}"),
            format!("rulesync-monitoring--{UID}"),
            "rulesync-monitoring-rules-not-a-uuid-at-all-but-long-enough".to_string(),
            format!("rulesync-monitoring-rules-{}", UID.replace('-', "")),
            format!("rulesync-monitoring-rules-{UID}-extra"),
            format!("rulesyncx-monitoring-rules-{UID}"),
            format!("rulesync-monitoring-rules-{{{}}}", &UID[..34]),
        ];
        for ns in cases {
            assert!(!is_managed_namespace("rulesync", &ns), "{ns} should not be managed");
        }
    }

    #[test]
    fn prefix_is_matched_literally() {
        let ns = format!("a.b+-monitoring-rules-{UID}");
        assert!(is_managed_namespace("a.b+", &ns));
        assert!(!is_managed_namespace("a.b", &ns));
        assert!(!is_managed_namespace("a.+", &format!("aab+-monitoring-rules-{UID}")));
    }
}
