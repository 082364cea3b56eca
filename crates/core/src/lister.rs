use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::LabelSelector;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRef {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A declared `PrometheusRule` as listed from the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredRule {
    pub namespace: String,
    pub name: String,
    /// `metadata.uid`
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    /// Raw `spec` object.
    pub spec: serde_json::Value,
}

/// Read access to declared rule resources.
#[async_trait::async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list_namespaces(&self, selector: &LabelSelector) -> Result<Vec<NamespaceRef>>;

    async fn list_rules(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<DeclaredRule>>;
}
