use super::*;
use crate::{
    access::tests::{strings, FakeInformer, FakeLegacy, FakeReviewer},
    cache::UserProjectCache,
    client,
};
use http_body_util::Full;
use maplit::btreemap;
use promql_parser::label::MatchOp;
use rbac_query_proxy_core::{ManagedClusterLabelAllowList, CLUSTER_LABEL, NAME_LABEL};
use rbac_query_proxy_transport::{ConfigSource, HttpsConnector};
use std::collections::BTreeMap;

struct Fixture {
    access: Option<BTreeMap<String, Vec<String>>>,
    clusters: Vec<String>,
    username: Option<String>,
    projects: Option<Vec<String>>,
    upstream: String,
    timeout: time::Duration,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            access: Some(btreemap! {
                "c1".to_string() => strings(&["ns1", "ns2"]),
                "c2".to_string() => strings(&["ns2", "ns3"]),
            }),
            clusters: strings(&["c1", "c2"]),
            username: None,
            projects: Some(Vec::new()),
            upstream: "http://metrics.example.com:8080/api/metrics/v1/default".to_string(),
            timeout: time::Duration::from_secs(5),
        }
    }
}

impl Fixture {
    fn build(self) -> (Proxy, RequestMetrics) {
        let (proxy, metrics, _) = self.build_with_legacy();
        (proxy, metrics)
    }

    fn build_with_legacy(self) -> (Proxy, RequestMetrics, Arc<FakeLegacy>) {
        let allowlist = ManagedClusterLabelAllowList::new(
            strings(&["cloud", "vendor", "name", "cluster.open-cluster-management.io/clusterset"]),
            Vec::<String>::new(),
        );

        let legacy = Arc::new(FakeLegacy {
            username: self.username,
            projects: self.projects,
            ..Default::default()
        });
        let resolver = AccessResolver::new(
            Arc::new(FakeReviewer {
                access: self.access,
            }),
            legacy.clone(),
            Arc::new(FakeInformer {
                synced: true,
                clusters: self.clusters,
                allowlist,
            }),
            UserProjectCache::new(time::Duration::from_secs(60)),
        );
        let metrics = RequestMetrics::default();
        let proxy = Proxy::new(
            resolver,
            client::build(connector()),
            Upstream::from_url(&self.upstream).expect("upstream must be valid"),
            self.timeout,
            metrics.clone(),
        );
        (proxy, metrics, legacy)
    }
}

fn connector() -> HttpsConnector {
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("versions must be supported")
    .with_root_certificates(rustls::RootCertStore::empty())
    .with_no_client_auth();
    HttpsConnector::new(
        ConfigSource::Fixed(Arc::new(config)),
        time::Duration::from_secs(1),
        time::Duration::from_secs(1),
    )
}

fn get(uri: &str) -> http::request::Builder {
    Request::get(uri)
        .header(&FORWARDED_TOKEN, "t0k3n")
        .header(&FORWARDED_USER, "alice")
}

async fn process(proxy: &Proxy, req: Request<&'static str>) -> Decision {
    let (parts, body) = req.into_parts();
    proxy.process(parts, Bytes::from_static(body.as_bytes())).await
}

async fn json_body(rsp: Response<Body>) -> serde_json::Value {
    let bytes = rsp
        .into_body()
        .collect()
        .await
        .expect("body must be readable")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body must be JSON")
}

async fn form_body(req: Request<Body>) -> Vec<(String, String)> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .expect("body must be readable")
        .to_bytes();
    decode(&bytes)
}

fn param<'p>(params: &'p [(String, String)], key: &str) -> Option<&'p str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Returns `(op, value)` for every matcher on `label` in `query`.
fn matchers_on(query: &str, label: &str) -> Vec<(&'static str, String)> {
    let expr = rewrite::parse(query).expect("forwarded query must parse");
    let mut found = Vec::new();
    rewrite::visit_selectors(&expr, &mut |vs| {
        for m in vs.matchers.matchers.iter().filter(|m| m.name == label) {
            let op = match m.op {
                MatchOp::Equal => "=",
                MatchOp::NotEqual => "!=",
                MatchOp::Re(_) => "=~",
                MatchOp::NotRe(_) => "!~",
            };
            found.push((op, m.value.clone()));
        }
    });
    found
}

fn expect_denied(decision: Decision) -> Response<Body> {
    match decision {
        Decision::Respond(rsp, Outcome::Denied) => rsp,
        decision => panic!("expected a denial, got {decision:?}"),
    }
}

fn expect_forward(decision: Decision, expected: Outcome) -> Request<Body> {
    match decision {
        Decision::Forward(req, outcome) if outcome == expected => req,
        decision => panic!("expected a forward with {expected:?}, got {decision:?}"),
    }
}

#[tokio::test]
async fn missing_token_yields_an_empty_matrix() {
    let (proxy, _) = Fixture::default().build();
    let req = Request::get("/api/v1/query?query=up")
        .header(&FORWARDED_USER, "alice")
        .body("")
        .unwrap();
    let rsp = expect_denied(process(&proxy, req).await);
    assert_eq!(rsp.status(), StatusCode::OK);
    assert_eq!(
        json_body(rsp).await,
        json!({"status": "success", "data": {"resultType": "matrix", "result": []}})
    );
}

#[tokio::test]
async fn authorization_header_is_forwarded_as_token() {
    let (proxy, _) = Fixture {
        access: Some(btreemap! { "*".to_string() => strings(&["*"]) }),
        ..Default::default()
    }
    .build();
    let req = Request::get("/api/v1/labels")
        .header(header::AUTHORIZATION, "Bearer t0k3n")
        .header(&FORWARDED_USER, "alice")
        .body("")
        .unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Forwarded);
    assert_eq!(req.headers()[&FORWARDED_TOKEN], "t0k3n");

    let req = Request::get("/api/v1/labels")
        .header(header::AUTHORIZATION, "Basic Zm9vOmJhcg==")
        .header(&FORWARDED_USER, "alice")
        .body("")
        .unwrap();
    expect_denied(process(&proxy, req).await);
}

#[tokio::test]
async fn username_is_looked_up_when_not_forwarded() {
    let (proxy, _) = Fixture {
        username: Some("bob".to_string()),
        access: Some(btreemap! { "*".to_string() => strings(&["*"]) }),
        ..Default::default()
    }
    .build();
    let req = Request::get("/api/v1/labels")
        .header(&FORWARDED_TOKEN, "t0k3n")
        .body("")
        .unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Forwarded);
    assert_eq!(req.headers()[&FORWARDED_USER], "bob");

    let (proxy, _) = Fixture::default().build();
    let req = Request::get("/api/v1/labels")
        .header(&FORWARDED_TOKEN, "t0k3n")
        .body("")
        .unwrap();
    expect_denied(process(&proxy, req).await);
}

#[tokio::test]
async fn no_managed_clusters_denies() {
    let (proxy, _) = Fixture {
        clusters: Vec::new(),
        ..Default::default()
    }
    .build();
    let req = get("/api/v1/query?query=up").body("").unwrap();
    expect_denied(process(&proxy, req).await);
}

#[tokio::test]
async fn series_for_label_metric_are_synthesized() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/series?match%5B%5D=acm_managed_cluster_labels")
        .body("")
        .unwrap();
    let Decision::Respond(rsp, Outcome::Synthetic) = process(&proxy, req).await else {
        panic!("expected a synthetic response");
    };
    assert_eq!(
        json_body(rsp).await,
        json!({
            "status": "success",
            "data": [
                {"__name__": "acm_managed_cluster_labels", "label_name": "cloud"},
                {"__name__": "acm_managed_cluster_labels", "label_name": "cluster_open_cluster_management_io_clusterset"},
                {"__name__": "acm_managed_cluster_labels", "label_name": "name"},
                {"__name__": "acm_managed_cluster_labels", "label_name": "vendor"},
            ],
        })
    );
}

#[tokio::test]
async fn label_values_for_label_metric_are_synthesized() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/label/label_name/values?match%5B%5D=acm_managed_cluster_labels%7Bname%3D%22c1%22%7D")
        .body("")
        .unwrap();
    let Decision::Respond(rsp, Outcome::Synthetic) = process(&proxy, req).await else {
        panic!("expected a synthetic response");
    };
    assert_eq!(
        json_body(rsp).await,
        json!({
            "status": "success",
            "data": ["cloud", "cluster_open_cluster_management_io_clusterset", "name", "vendor"],
        })
    );
}

#[tokio::test]
async fn other_series_requests_are_not_synthesized() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/series?match%5B%5D=up%7Bjob%3D%22acm_managed_cluster_labels%22%7D")
        .body("")
        .unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    let form = form_body(req).await;
    let query = param(&form, "match[]").expect("match[] must be forwarded");
    assert_eq!(matchers_on(query, CLUSTER_LABEL), vec![("=~", "c1|c2".to_string())]);
}

#[tokio::test]
async fn unrestricted_queries_are_forwarded_unchanged() {
    let (proxy, metrics) = Fixture {
        access: Some(btreemap! {
            "c1".to_string() => Vec::new(),
            "c2".to_string() => strings(&["*"]),
        }),
        ..Default::default()
    }
    .build();
    let req = get("/api/v1/query?query=up&time=1700000000").body("").unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Forwarded);

    assert_eq!(req.method(), Method::POST);
    assert_eq!(
        req.uri(),
        "http://metrics.example.com:8080/api/metrics/v1/default/api/v1/query"
    );
    assert_eq!(req.headers()[header::CONTENT_TYPE], FORM_CONTENT_TYPE);
    let form = form_body(req).await;
    assert_eq!(param(&form, "query"), Some("up"));
    assert_eq!(param(&form, "time"), Some("1700000000"));
    assert_eq!(metrics.count(Outcome::Forwarded), 0, "process does not record");
}

#[tokio::test]
async fn restricted_queries_are_filtered() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/query_range?query=sum(rate(http_requests_total%5B5m%5D))&step=30")
        .body("")
        .unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    let form = form_body(req).await;
    let query = param(&form, "query").expect("query must be forwarded");
    assert_eq!(matchers_on(query, CLUSTER_LABEL), vec![("=~", "c1|c2".to_string())]);
    assert_eq!(matchers_on(query, NAMESPACE_LABEL), vec![("=", "ns2".to_string())]);
    assert_eq!(param(&form, "step"), Some("30"));
}

#[tokio::test]
async fn namespaces_follow_referenced_clusters() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/query?query=up%7Bcluster%3D%22c1%22%7D").body("").unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    let form = form_body(req).await;
    let query = param(&form, "query").expect("query must be forwarded");
    assert_eq!(
        matchers_on(query, NAMESPACE_LABEL),
        vec![("=~", "ns1|ns2".to_string())]
    );
}

#[tokio::test]
async fn label_metric_queries_skip_namespace_filtering() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/query?query=acm_managed_cluster_labels").body("").unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    let form = form_body(req).await;
    let query = param(&form, "query").expect("query must be forwarded");
    assert_eq!(matchers_on(query, NAME_LABEL), vec![("=~", "c1|c2".to_string())]);
    assert!(matchers_on(query, NAMESPACE_LABEL).is_empty());
    assert!(matchers_on(query, CLUSTER_LABEL).is_empty());
}

#[tokio::test]
async fn post_form_bodies_are_filtered() {
    let (proxy, _) = Fixture {
        access: Some(btreemap! { "c1".to_string() => strings(&["ns1"]) }),
        ..Default::default()
    }
    .build();
    let req = Request::post("/api/v1/query?dedup=true")
        .header(&FORWARDED_TOKEN, "t0k3n")
        .header(&FORWARDED_USER, "alice")
        .header(header::CONTENT_TYPE, FORM_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, "8")
        .body("query=up")
        .unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.uri().query(), Some("dedup=true"));
    assert!(!req.headers().contains_key(header::CONTENT_LENGTH));
    let form = form_body(req).await;
    let query = param(&form, "query").expect("query must be forwarded");
    assert_eq!(matchers_on(query, CLUSTER_LABEL), vec![("=", "c1".to_string())]);
    assert_eq!(matchers_on(query, NAMESPACE_LABEL), vec![("=", "ns1".to_string())]);
}

#[tokio::test]
async fn form_content_types_are_case_insensitive() {
    let (proxy, _) = Fixture {
        access: Some(btreemap! { "c1".to_string() => strings(&["ns1"]) }),
        ..Default::default()
    }
    .build();
    for content_type in [
        "Application/X-WWW-Form-Urlencoded",
        "application/x-www-form-urlencoded; charset=UTF-8",
        "APPLICATION/X-WWW-FORM-URLENCODED ;charset=utf-8",
    ] {
        let req = Request::post("/api/v1/query")
            .header(&FORWARDED_TOKEN, "t0k3n")
            .header(&FORWARDED_USER, "alice")
            .header(header::CONTENT_TYPE, content_type)
            .body("query=up")
            .unwrap();
        let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
        let form = form_body(req).await;
        let query = param(&form, "query").expect("query must be forwarded");
        assert_eq!(
            matchers_on(query, CLUSTER_LABEL),
            vec![("=", "c1".to_string())],
            "{content_type}"
        );
        assert_eq!(
            matchers_on(query, NAMESPACE_LABEL),
            vec![("=", "ns1".to_string())],
            "{content_type}"
        );
    }
}

#[tokio::test]
async fn other_post_bodies_are_forwarded_unchanged() {
    let (proxy, _) = Fixture {
        access: Some(btreemap! { "c1".to_string() => strings(&["ns1"]) }),
        ..Default::default()
    }
    .build();
    let req = Request::post("/api/v1/query?query=up")
        .header(&FORWARDED_TOKEN, "t0k3n")
        .header(&FORWARDED_USER, "alice")
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"query":"up"}"#)
        .unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    assert_eq!(
        req.headers().get(header::CONTENT_TYPE),
        Some(&HeaderValue::from_static("application/json"))
    );

    let params = decode(req.uri().query().expect("query string must be forwarded").as_bytes());
    let query = param(&params, "query").expect("query must be forwarded");
    assert_eq!(matchers_on(query, CLUSTER_LABEL), vec![("=", "c1".to_string())]);
    assert_eq!(matchers_on(query, NAMESPACE_LABEL), vec![("=", "ns1".to_string())]);

    let body = req
        .into_body()
        .collect()
        .await
        .expect("body must be readable")
        .to_bytes();
    assert_eq!(body, Bytes::from_static(br#"{"query":"up"}"#));
}

#[tokio::test]
async fn callers_without_access_are_filtered_to_nothing() {
    let (proxy, _) = Fixture {
        access: Some(BTreeMap::new()),
        ..Default::default()
    }
    .build();
    let req = get("/api/v1/query?query=up").body("").unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    let form = form_body(req).await;
    let query = param(&form, "query").expect("query must be forwarded");
    assert_eq!(matchers_on(query, CLUSTER_LABEL), vec![("=", String::new())]);
}

#[tokio::test]
async fn invalid_queries_are_rejected() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/query?query=sum(up").body("").unwrap();
    let Decision::Respond(rsp, Outcome::BadQuery) = process(&proxy, req).await else {
        panic!("expected a rejection");
    };
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(rsp).await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["errorType"], "bad_data");
}

#[tokio::test]
async fn review_failures_are_errors() {
    let (proxy, _) = Fixture {
        access: None,
        ..Default::default()
    }
    .build();
    let req = get("/api/v1/query?query=up").body("").unwrap();
    let Decision::Respond(rsp, Outcome::ReviewFailed) = process(&proxy, req).await else {
        panic!("expected a failure");
    };
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn projects_are_listed_once_per_request() {
    let (proxy, _, legacy) = Fixture {
        projects: None,
        ..Default::default()
    }
    .build_with_legacy();
    let req = get("/api/v1/query?query=up").body("").unwrap();
    expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    assert_eq!(*legacy.project_calls.lock(), 1);

    let (proxy, _, legacy) = Fixture {
        access: Some(btreemap! { "c1".to_string() => strings(&["*"]) }),
        projects: Some(strings(&["c2"])),
        ..Default::default()
    }
    .build_with_legacy();
    let req = get("/api/v1/query?query=up").body("").unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Forwarded);
    assert_eq!(*legacy.project_calls.lock(), 1);
    let form = form_body(req).await;
    assert_eq!(param(&form, "query"), Some("up"));
}

#[tokio::test]
async fn other_requests_keep_their_method() {
    let (proxy, _) = Fixture::default().build();
    let req = get("/api/v1/labels?match%5B%5D=up").body("").unwrap();
    let req = expect_forward(process(&proxy, req).await, Outcome::Rewritten);
    assert_eq!(req.method(), Method::GET);
    assert_eq!(req.uri().path(), "/api/metrics/v1/default/api/v1/labels");
    let query = decode(req.uri().query().unwrap_or_default().as_bytes());
    let matcher = param(&query, "match[]").expect("match[] must be forwarded");
    assert_eq!(matchers_on(matcher, CLUSTER_LABEL), vec![("=~", "c1|c2".to_string())]);
}

#[test]
fn upstream_urls_require_scheme_and_host() {
    let upstream = Upstream::from_url("https://observatorium:8443/api/metrics/v1/default/")
        .expect("upstream must be valid");
    assert_eq!(
        upstream.base().unwrap(),
        "https://observatorium:8443/api/metrics/v1/default/"
    );
    assert!(Upstream::from_url("/api/metrics").is_err());
}

mod forward {
    use super::*;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Serves every request with a JSON echo of its method, path and body.
    async fn echo_upstream() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener must bind");
        let addr = listener.local_addr().expect("listener must have an address");
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let svc = service_fn(|req: Request<Incoming>| async move {
                        let method = req.method().to_string();
                        let path = req.uri().path().to_string();
                        let body = req.into_body().collect().await?.to_bytes();
                        let echo = json!({
                            "method": method,
                            "path": path,
                            "body": String::from_utf8_lossy(&body),
                        });
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(echo.to_string()))))
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(socket), svc)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn forwards_to_upstream() {
        let addr = echo_upstream().await;
        let (proxy, metrics) = Fixture {
            upstream: format!("http://{addr}/api/metrics/v1/default"),
            ..Default::default()
        }
        .build();
        let (parts, _) = get("/api/v1/query?query=up").body(()).unwrap().into_parts();
        let rsp = proxy.handle(parts, Bytes::new()).await;
        assert_eq!(rsp.status(), StatusCode::OK);

        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        let echo: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(echo["method"], "POST");
        assert_eq!(echo["path"], "/api/metrics/v1/default/api/v1/query");
        let form = decode(echo["body"].as_str().unwrap().as_bytes());
        let query = param(&form, "query").expect("query must be forwarded");
        assert_eq!(matchers_on(query, CLUSTER_LABEL), vec![("=~", "c1|c2".to_string())]);
        assert_eq!(metrics.count(Outcome::Rewritten), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_bad_gateway() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (proxy, metrics) = Fixture {
            upstream: format!("http://{addr}"),
            ..Default::default()
        }
        .build();
        let (parts, _) = get("/api/v1/query?query=up").body(()).unwrap().into_parts();
        let rsp = proxy.handle(parts, Bytes::new()).await;
        assert_eq!(rsp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(metrics.count(Outcome::UpstreamError), 1);
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            time::sleep(time::Duration::from_secs(30)).await;
            drop(socket);
        });
        let (proxy, _) = Fixture {
            upstream: format!("http://{addr}"),
            timeout: time::Duration::from_millis(100),
            ..Default::default()
        }
        .build();
        let (parts, _) = get("/api/v1/query?query=up").body(()).unwrap().into_parts();
        let rsp = proxy.handle(parts, Bytes::new()).await;
        assert_eq!(rsp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn readiness_requires_a_reachable_upstream() {
        let addr = echo_upstream().await;
        let (proxy, _) = Fixture {
            upstream: format!("http://{addr}"),
            ..Default::default()
        }
        .build();
        proxy
            .ready(time::Duration::from_secs(5))
            .await
            .expect("proxy must be ready");
    }
}
