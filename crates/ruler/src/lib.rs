//! rulesync ruler client: list, upsert and delete rule groups on a Loki ruler.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use rulesync_core::{RuleGroup, RuleGroupsByNamespace};
use tracing::debug;
use url::Url;

const API_PATH: [&str; 4] = ["loki", "api", "v1", "rules"];
const LEGACY_API_PATH: [&str; 3] = ["api", "prom", "rules"];
const TENANT_HEADER: &str = "X-Scope-OrgID";

#[derive(Debug, thiserror::Error)]
pub enum RulerError {
    #[error("ruler address {0} cannot be used as a base URL")]
    BaseUrl(String),
    #[error("ruler request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ruler returned {status} for {method} {path}: {body}")]
    Status { method: String, path: String, status: u16, body: String },
    #[error("ruler payload: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Operations the controller needs from the ruler.
#[async_trait::async_trait]
pub trait RulerClient: Send + Sync {
    /// All rule groups in namespaces starting with `namespace_prefix` (empty = all).
    async fn list_rules(&self, namespace_prefix: &str) -> Result<RuleGroupsByNamespace, RulerError>;

    /// Create or replace `group` in `namespace`.
    async fn create_rule_group(&self, namespace: &str, group: &RuleGroup) -> Result<(), RulerError>;

    async fn delete_rule_group(&self, namespace: &str, group: &str) -> Result<(), RulerError>;
}

#[derive(Debug, Clone)]
pub struct RulerConfig {
    pub address: Url,
    /// Sent as `X-Scope-OrgID` for multi-tenant rulers.
    pub tenant_id: Option<String>,
    pub bearer_token: Option<String>,
    /// Use `/api/prom/rules` instead of `/loki/api/v1/rules`.
    pub use_legacy_routes: bool,
    pub timeout: Duration,
}

impl RulerConfig {
    pub fn new(address: Url) -> Self {
        Self { address, tenant_id: None, bearer_token: None, use_legacy_routes: false, timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRulerClient {
    http: reqwest::Client,
    cfg: Arc<RulerConfig>,
}

impl HttpRulerClient {
    pub fn new(cfg: RulerConfig) -> Result<Self, RulerError> {
        if cfg.address.cannot_be_a_base() {
            return Err(RulerError::BaseUrl(cfg.address.to_string()));
        }
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg: Arc::new(cfg) })
    }

    /// Rules endpoint joined with percent-encoded `segments`.
    fn url(&self, segments: &[&str]) -> Result<Url, RulerError> {
        let mut url = self.cfg.address.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| RulerError::BaseUrl(self.cfg.address.to_string()))?;
            path.pop_if_empty();
            if self.cfg.use_legacy_routes {
                path.extend(LEGACY_API_PATH);
            } else {
                path.extend(API_PATH);
            }
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut rb = self.http.request(method, url);
        if let Some(tenant) = &self.cfg.tenant_id {
            rb = rb.header(TENANT_HEADER, tenant);
        }
        if let Some(token) = &self.cfg.bearer_token {
            rb = rb.bearer_auth(token);
        }
        rb
    }

    /// Send and turn non-2xx responses (other than the `allow`ed status) into errors.
    async fn send(&self, op: &'static str, method: Method, url: Url, body: Option<String>, allow: Option<StatusCode>) -> Result<Response, RulerError> {
        let t0 = Instant::now();
        let path = url.path().to_string();
        let mut rb = self.request(method.clone(), url);
        if let Some(body) = body {
            rb = rb.header(reqwest::header::CONTENT_TYPE, "application/yaml").body(body);
        }
        let res = match rb.send().await {
            Ok(res) => res,
            Err(e) => {
                counter!("rulesync_ruler_requests_total", 1, "op" => op, "result" => "error");
                return Err(e.into());
            }
        };
        let status = res.status();
        histogram!("rulesync_ruler_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        debug!(op, %path, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "ruler: response");
        if status.is_success() || Some(status) == allow {
            counter!("rulesync_ruler_requests_total", 1, "op" => op, "result" => "ok");
            return Ok(res);
        }
        counter!("rulesync_ruler_requests_total", 1, "op" => op, "result" => "error");
        let body = res.text().await.unwrap_or_default();
        Err(RulerError::Status { method: method.to_string(), path, status: status.as_u16(), body: body.trim().to_string() })
    }
}

#[async_trait::async_trait]
impl RulerClient for HttpRulerClient {
    async fn list_rules(&self, namespace_prefix: &str) -> Result<RuleGroupsByNamespace, RulerError> {
        let url = self.url(&[])?;
        // The ruler answers 404 when no rule groups exist at all.
        let res = self.send("list", Method::GET, url, None, Some(StatusCode::NOT_FOUND)).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(RuleGroupsByNamespace::new());
        }
        let body = res.text().await?;
        if body.trim().is_empty() {
            return Ok(RuleGroupsByNamespace::new());
        }
        let mut all: RuleGroupsByNamespace = serde_yaml::from_str(&body)?;
        all.retain(|ns, _| ns.starts_with(namespace_prefix));
        Ok(all)
    }

    async fn create_rule_group(&self, namespace: &str, group: &RuleGroup) -> Result<(), RulerError> {
        let url = self.url(&[namespace])?;
        let body = serde_yaml::to_string(group)?;
        self.send("create", Method::POST, url, Some(body), None).await?;
        Ok(())
    }

    async fn delete_rule_group(&self, namespace: &str, group: &str) -> Result<(), RulerError> {
        let url = self.url(&[namespace, group])?;
        // Already gone is what we wanted.
        self.send("delete", Method::DELETE, url, None, Some(StatusCode::NOT_FOUND)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulesync_core::Rule;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> HttpRulerClient {
        let mut cfg = RulerConfig::new(uri.parse().unwrap());
        cfg.tenant_id = Some("team-a".into());
        HttpRulerClient::new(cfg).unwrap()
    }

    fn group() -> RuleGroup {
        RuleGroup {
            name: "errors".into(),
            rules: vec![Rule::alerting("HighErrors", "sum(rate({app=\"x\"}[5m])) > 1")],
            ..RuleGroup::default()
        }
    }

    #[test]
    fn urls_encode_segments_and_keep_base_path() {
        let c = HttpRulerClient::new(RulerConfig::new("http://ruler:3100/gateway/".parse().unwrap())).unwrap();
        let url = c.url(&["ns", "a/b c"]).unwrap();
        assert_eq!(url.path(), "/gateway/loki/api/v1/rules/ns/a%2Fb%20c");

        let mut cfg = RulerConfig::new("http://ruler:3100".parse().unwrap());
        cfg.use_legacy_routes = true;
        let legacy = HttpRulerClient::new(cfg).unwrap();
        assert_eq!(legacy.url(&[]).unwrap().path(), "/api/prom/rules");
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let server = MockServer::start().await;
        let body = "rulesync-mon-a-uid:\n  - name: errors\n    rules:\n      - alert: A\n        expr: up == 0\n        for: 300s\nother:\n  - name: theirs\n    rules: []\n";
        Mock::given(method("GET"))
            .and(path("/loki/api/v1/rules"))
            .and(header("X-Scope-OrgID", "team-a"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let all = c.list_rules("").await.unwrap();
        assert_eq!(all.len(), 2);
        let ours = c.list_rules("rulesync-").await.unwrap();
        assert_eq!(ours.keys().collect::<Vec<_>>(), vec!["rulesync-mon-a-uid"]);
        assert_eq!(ours["rulesync-mon-a-uid"][0].rules[0].for_.unwrap().to_string(), "5m");
    }

    #[tokio::test]
    async fn list_treats_not_found_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loki/api/v1/rules"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no rule groups found"))
            .mount(&server)
            .await;
        assert!(client(&server.uri()).list_rules("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_posts_yaml_group() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/loki/api/v1/rules/rulesync-mon-a-uid"))
            .and(header("content-type", "application/yaml"))
            .and(body_string_contains("name: errors"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        client(&server.uri()).create_rule_group("rulesync-mon-a-uid", &group()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_reports_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/loki/api/v1/rules/ns/errors"))
            .respond_with(ResponseTemplate::new(500).set_body_string("ruler unavailable"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/loki/api/v1/rules/ns/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let err = c.delete_rule_group("ns", "errors").await.unwrap_err();
        match err {
            RulerError::Status { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "ruler unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
        c.delete_rule_group("ns", "gone").await.unwrap();
    }
}
