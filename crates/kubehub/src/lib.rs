//! rulesync kubehub: PrometheusRule and Namespace watches feeding the work
//! queue and in-memory stores, and the store-backed lister used to build
//! desired state.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta},
    runtime::{
        reflector::{self, reflector, Store},
        reflector::store::Writer,
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
    Client, Resource,
};
use metrics::counter;
use rulesync_core::{DeclaredRule, Event, LabelSelector, NamespaceRef, ResourceLister};
use rulesync_queue::WorkQueue;
use tracing::{debug, info, warn};

pub const RULE_GROUP: &str = "monitoring.coreos.com";
pub const RULE_VERSION: &str = "v1";
pub const RULE_KIND: &str = "PrometheusRule";
pub const RULE_PLURAL: &str = "prometheusrules";

/// `monitoring.coreos.com/v1` `PrometheusRule`, addressed dynamically.
pub fn prometheus_rule_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(RULE_GROUP, RULE_VERSION, RULE_KIND);
    ApiResource::from_gvk_with_plural(&gvk, RULE_PLURAL)
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client (kubeconfig or in-cluster)")
}

fn object_key(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or("");
    match meta.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> { meta.labels.clone().unwrap_or_default() }

fn declared_from(obj: &DynamicObject) -> Result<DeclaredRule> {
    let meta = &obj.metadata;
    let name = meta.name.clone().ok_or_else(|| anyhow!("PrometheusRule missing metadata.name"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| anyhow!("PrometheusRule {} missing metadata.namespace", name))?;
    let uid = meta
        .uid
        .clone()
        .ok_or_else(|| anyhow!("PrometheusRule {}/{} missing metadata.uid", namespace, name))?;
    let spec = obj.data.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    Ok(DeclaredRule { namespace, name, uid, labels: labels_of(meta), spec })
}

fn selector_config(selector: &LabelSelector) -> watcher::Config {
    let cfg = watcher::Config::default();
    if selector.is_empty() {
        cfg
    } else {
        cfg.labels(&selector.to_string())
    }
}

/// Empty `PrometheusRule` store and the writer the rule watch feeds.
pub fn rule_store() -> (Store<DynamicObject>, Writer<DynamicObject>) {
    let writer = Writer::new(prometheus_rule_resource());
    (writer.as_reader(), writer)
}

pub fn namespace_store() -> (Store<Namespace>, Writer<Namespace>) { reflector::store() }

/// Serves listings from the in-memory stores kept by the watches, so a
/// reconciliation pass makes no API calls for desired state.
#[derive(Clone)]
pub struct KubeLister {
    namespaces: Store<Namespace>,
    rules: Store<DynamicObject>,
}

impl KubeLister {
    pub fn new(namespaces: Store<Namespace>, rules: Store<DynamicObject>) -> Self { Self { namespaces, rules } }
}

#[async_trait::async_trait]
impl ResourceLister for KubeLister {
    async fn list_namespaces(&self, selector: &LabelSelector) -> Result<Vec<NamespaceRef>> {
        self.namespaces.wait_until_ready().await.context("namespace watch stopped before its first listing")?;
        let mut out: Vec<NamespaceRef> = self
            .namespaces
            .state()
            .iter()
            .filter_map(|ns| {
                let name = ns.metadata.name.clone()?;
                Some(NamespaceRef { labels: labels_of(&ns.metadata), name })
            })
            .filter(|ns| selector.matches(&ns.labels))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn list_rules(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<DeclaredRule>> {
        self.rules.wait_until_ready().await.context("rule watch stopped before its first listing")?;
        let mut out = self
            .rules
            .state()
            .iter()
            .filter(|o| o.metadata.namespace.as_deref() == Some(namespace) && selector.matches(&labels_of(&o.metadata)))
            .map(|o| declared_from(o))
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Watch `PrometheusRule`s in all namespaces, keep `store` current and enqueue
/// a `ResourceChanged` event for every applied or deleted object. Runs until
/// the stream ends.
pub async fn watch_rules(
    client: Client,
    selector: &LabelSelector,
    store: Writer<DynamicObject>,
    queue: WorkQueue<Event>,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client, &prometheus_rule_resource());
    info!(selector = %selector, "watcher started (rules)");
    forward(reflector(store, watcher::watcher(api, selector_config(selector))), "rule", &queue).await
}

/// Namespace label changes move rules in and out of scope, so they trigger a pass too.
pub async fn watch_namespaces(
    client: Client,
    selector: &LabelSelector,
    store: Writer<Namespace>,
    queue: WorkQueue<Event>,
) -> Result<()> {
    let api: Api<Namespace> = Api::all(client);
    info!(selector = %selector, "watcher started (namespaces)");
    forward(reflector(store, watcher::watcher(api, selector_config(selector))), "namespace", &queue).await
}

async fn forward<K, S>(stream: S, what: &'static str, queue: &WorkQueue<Event>) -> Result<()>
where
    K: Resource,
    S: Stream<Item = Result<WatchEvent<K>, watcher::Error>> + Send,
{
    let stream = stream.default_backoff();
    futures::pin_mut!(stream);
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(WatchEvent::Applied(o)) | Ok(WatchEvent::Deleted(o)) => enqueue(queue, what, o.meta()),
            Ok(WatchEvent::Restarted(list)) => {
                // Every pass reconciles everything, so one event covers the relist.
                debug!(what, count = list.len(), "watch restart");
                if let Some(o) = list.first() {
                    enqueue(queue, what, o.meta());
                }
            }
            Err(e) => warn!(what, error = %e, "watch error; backing off"),
        }
        if queue.is_shutting_down() {
            break;
        }
    }
    warn!(what, "watcher stream ended");
    Ok(())
}

fn enqueue(queue: &WorkQueue<Event>, what: &'static str, meta: &ObjectMeta) {
    let key = object_key(meta);
    counter!("rulesync_watch_events_total", 1, "kind" => what);
    debug!(what, key = %key, "enqueue resource change");
    queue.add(Event::resource_changed(key));
}
