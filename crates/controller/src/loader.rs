//! Desired state: every selected `PrometheusRule` mapped to its ruler namespace.

use anyhow::{Context, Result};
use rulesync_core::rules::rule_groups_from_spec;
use rulesync_core::{namespace_for_rule, LabelSelector, ResourceLister, RuleGroupsByNamespace};
use tracing::debug;

/// List namespaces matching `ns_selector`, then the rules in each matching
/// `rule_selector`, and convert every rule spec. The first error aborts the load.
pub async fn load_desired(
    lister: &dyn ResourceLister,
    ns_selector: &LabelSelector,
    rule_selector: &LabelSelector,
    prefix: &str,
) -> Result<RuleGroupsByNamespace> {
    let namespaces = lister.list_namespaces(ns_selector).await.context("listing namespaces")?;
    let mut desired = RuleGroupsByNamespace::new();
    for ns in &namespaces {
        let rules = lister
            .list_rules(&ns.name, rule_selector)
            .await
            .with_context(|| format!("listing PrometheusRules in {}", ns.name))?;
        for rule in rules {
            let groups = rule_groups_from_spec(&rule.spec)
                .with_context(|| format!("converting PrometheusRule {}/{}", rule.namespace, rule.name))?;
            let ruler_ns = namespace_for_rule(prefix, &rule.namespace, &rule.name, &rule.uid);
            debug!(ns = %ruler_ns, groups = groups.len(), "desired rule groups");
            desired.insert(ruler_ns, groups);
        }
    }
    Ok(desired)
}
