use crate::{
    access::AccessResolver,
    client::{Body, HttpClient},
    metrics::{Outcome, RequestMetrics},
};
use anyhow::{anyhow, Context as _, Result};
use bytes::Bytes;
use futures::future;
use http::{
    header::{self, HeaderName, HeaderValue},
    request,
    uri::{Authority, Scheme},
    HeaderMap, Method, Request, Response, StatusCode, Uri,
};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use rbac_query_proxy_core::{
    access::{self, AccessControlMap},
    rewrite, MANAGED_CLUSTER_LABEL_METRIC, NAMESPACE_LABEL, WILDCARD,
};
use serde_json::json;
use std::{sync::Arc, task};
use tokio::time;

#[cfg(test)]
mod tests;

/// Carries the caller's bearer token to the upstream.
pub const FORWARDED_TOKEN: HeaderName = HeaderName::from_static("x-forwarded-access-token");

/// Carries the caller's username to the upstream.
pub const FORWARDED_USER: HeaderName = HeaderName::from_static("x-forwarded-user");

const SERIES_PATH: &str = "/api/v1/series";
const LABEL_VALUES_PATH: &str = "/api/v1/label/label_name/values";

/// Endpoints whose GET requests are forwarded as form POSTs.
const QUERY_PATHS: [&str; 3] = ["/api/v1/query", "/api/v1/query_range", SERIES_PATH];

/// Parameters that carry PromQL and must be filtered.
const QUERY_PARAMS: [&str; 2] = ["query", "match[]"];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Connection-level headers that are not forwarded upstream.
const UNFORWARDED: [HeaderName; 10] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Enforces metrics access on every request before forwarding it upstream.
#[derive(Clone, Debug)]
pub struct Proxy(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    resolver: AccessResolver,
    client: HttpClient,
    upstream: Upstream,
    timeout: time::Duration,
    metrics: RequestMetrics,
}

/// The metrics store's scheme, authority and fixed base path.
#[derive(Clone, Debug)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

/// How a request is disposed of once access has been enforced.
#[derive(Debug)]
pub(crate) enum Decision {
    Respond(Response<Body>, Outcome),
    Forward(Request<Body>, Outcome),
}

/// Query parameters and, for form POSTs, body parameters.
#[derive(Debug)]
struct Params {
    query: Vec<(String, String)>,
    form: Option<Vec<(String, String)>>,
}

// === impl Proxy ===

impl Proxy {
    pub fn new(
        resolver: AccessResolver,
        client: HttpClient,
        upstream: Upstream,
        timeout: time::Duration,
        metrics: RequestMetrics,
    ) -> Self {
        Self(Arc::new(Inner {
            resolver,
            client,
            upstream,
            timeout,
            metrics,
        }))
    }

    /// Indicates whether the informer synced and the upstream answers a request within `timeout`.
    pub(crate) async fn ready(&self, timeout: time::Duration) -> Result<()> {
        if !self.0.resolver.informer().has_synced() {
            return Err(anyhow!("informer has not synced"));
        }
        let uri = self.0.upstream.base()?;
        let req = Request::get(uri).body(Body::default())?;
        match time::timeout(timeout, self.0.client.request(req)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(anyhow!(error).context("upstream is unreachable")),
            Err(_) => Err(anyhow!("upstream did not respond within {timeout:?}")),
        }
    }

    async fn handle(&self, parts: request::Parts, body: Bytes) -> Response<ResponseBody> {
        let (req, outcome) = match self.process(parts, body).await {
            Decision::Respond(rsp, outcome) => {
                self.0.metrics.record(outcome);
                return rsp.map(boxed);
            }
            Decision::Forward(req, outcome) => (req, outcome),
        };

        let start = time::Instant::now();
        let rsp = time::timeout(self.0.timeout, self.0.client.request(req)).await;
        self.0.metrics.observe_upstream(start);
        match rsp {
            Ok(Ok(rsp)) => {
                self.0.metrics.record(outcome);
                rsp.map(|body| body.boxed())
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, "Upstream request failed");
                self.0.metrics.record(Outcome::UpstreamError);
                api_error(StatusCode::BAD_GATEWAY, "unavailable", &error.to_string()).map(boxed)
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.0.timeout, "Upstream request timed out");
                self.0.metrics.record(Outcome::UpstreamError);
                api_error(StatusCode::GATEWAY_TIMEOUT, "timeout", "upstream request timed out")
                    .map(boxed)
            }
        }
    }

    pub(crate) async fn process(&self, parts: request::Parts, body: Bytes) -> Decision {
        let request::Parts {
            method,
            uri,
            mut headers,
            ..
        } = parts;

        let Some(token) = bearer_token(&mut headers) else {
            return deny("found unauthorized user");
        };
        let username = match forwarded_user(&headers) {
            Some(username) => username,
            None => match self.0.resolver.legacy().username(&token).await {
                Ok(username) => {
                    if let Ok(value) = HeaderValue::from_str(&username) {
                        headers.insert(FORWARDED_USER, value);
                    }
                    username
                }
                Err(error) => {
                    tracing::debug!(error = %format_args!("{error:#}"), "Failed to look up user");
                    return deny("failed to resolve user");
                }
            },
        };

        let projects = self.0.resolver.projects(&username, &token).await;

        let clusters = self.0.resolver.informer().managed_cluster_names();
        if clusters.is_empty() {
            return deny("no project or cluster found");
        }

        let mut params = Params::from_request(&method, &uri, &headers, &body);
        if let Some(rsp) = self.synthetic(uri.path(), &params) {
            tracing::debug!(path = %uri.path(), "Answered from the label allowlist");
            return Decision::Respond(rsp, Outcome::Synthetic);
        }

        let access = match self
            .0
            .resolver
            .resolve_with_projects(&username, &token, projects)
            .await
        {
            Ok(access) => access,
            Err(error) => {
                tracing::warn!(%username, error = %format_args!("{error:#}"), "Failed to resolve access");
                return Decision::Respond(
                    api_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal",
                        "failed to resolve metrics access",
                    ),
                    Outcome::ReviewFailed,
                );
            }
        };

        let outcome = if access::can_access_all(&access, clusters.keys().map(String::as_str)) {
            Outcome::Forwarded
        } else {
            if let Err(error) = params.rewrite(|query| rewrite_query(query, &access)) {
                tracing::info!(%username, %error, "Rejecting query");
                return Decision::Respond(
                    api_error(StatusCode::BAD_REQUEST, "bad_data", &error.to_string()),
                    Outcome::BadQuery,
                );
            }
            Outcome::Rewritten
        };

        match self.0.upstream.request(method, uri.path(), headers, params, body) {
            Ok(req) => Decision::Forward(req, outcome),
            Err(error) => {
                tracing::info!(error = %format_args!("{error:#}"), "Invalid request");
                Decision::Respond(
                    api_error(StatusCode::BAD_REQUEST, "bad_data", &format!("{error:#}")),
                    Outcome::BadQuery,
                )
            }
        }
    }

    /// Answers label-discovery requests for the managed-cluster label metric from the allowlist.
    fn synthetic(&self, path: &str, params: &Params) -> Option<Response<Body>> {
        if path != SERIES_PATH && path != LABEL_VALUES_PATH {
            return None;
        }
        if !params.queries().any(references_label_metric) {
            return None;
        }

        let labels = self
            .0
            .resolver
            .informer()
            .managed_cluster_label_list()
            .regex_label_list;
        let data = if path == SERIES_PATH {
            labels
                .iter()
                .map(|label| json!({ "__name__": MANAGED_CLUSTER_LABEL_METRIC, "label_name": label }))
                .collect::<Vec<_>>()
        } else {
            labels.iter().map(|label| json!(label)).collect()
        };
        Some(json_response(
            StatusCode::OK,
            json!({ "status": "success", "data": data }),
        ))
    }
}

impl tower::Service<Request<Incoming>> for Proxy {
    type Response = Response<ResponseBody>;
    type Error = hyper::Error;
    type Future = future::BoxFuture<'static, Result<Response<ResponseBody>, hyper::Error>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), hyper::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok(proxy.handle(parts, body).await)
        })
    }
}

/// Filters `query` to the clusters in `access`, then to the namespaces common to the clusters it
/// references.
fn rewrite_query(query: &str, access: &AccessControlMap) -> Result<String, rewrite::Error> {
    let clusters = access.keys().cloned().collect::<Vec<_>>();
    let rewritten = rewrite::inject_cluster_labels(query, &clusters)?;

    // The label metric is scoped by cluster identity alone.
    if references_label_metric(query) {
        return Ok(rewritten);
    }

    let referenced = access::clusters_referenced_in_query(query, &clusters)?;
    let namespaces = access::common_namespaces_across_clusters(&referenced, access);
    if namespaces == [WILDCARD] {
        return Ok(rewritten);
    }
    rewrite::inject_label(&rewritten, NAMESPACE_LABEL, &namespaces)
}

fn references_label_metric(query: &str) -> bool {
    let Ok(expr) = rewrite::parse(query) else {
        return false;
    };
    let mut found = false;
    rewrite::visit_selectors(&expr, &mut |vs| {
        found |= rewrite::metric_name(vs) == Some(MANAGED_CLUSTER_LABEL_METRIC);
    });
    found
}

/// Returns the caller's bearer token, copying an `Authorization` bearer token into the forwarded
/// token header.
fn bearer_token(headers: &mut HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(&FORWARDED_TOKEN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    let token = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim()
        .to_string();
    if token.is_empty() {
        return None;
    }
    let value = HeaderValue::from_str(&token).ok()?;
    headers.insert(FORWARDED_TOKEN, value);
    Some(token)
}

fn forwarded_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&FORWARDED_USER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(String::from)
}

fn deny(reason: &'static str) -> Decision {
    tracing::debug!(reason, "Denying request");
    Decision::Respond(
        json_response(
            StatusCode::OK,
            json!({
                "status": "success",
                "data": { "resultType": "matrix", "result": [] },
            }),
        ),
        Outcome::Denied,
    )
}

fn api_error(status: StatusCode, error_type: &str, error: &str) -> Response<Body> {
    json_response(
        status,
        json!({ "status": "error", "errorType": error_type, "error": error }),
    )
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .expect("json response must be valid")
}

fn boxed(body: Body) -> ResponseBody {
    body.map_err(|never| match never {}).boxed()
}

fn encode(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn decode(bytes: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(bytes).into_owned().collect()
}

/// Media types are case-insensitive and may carry parameters, e.g. `; charset=utf-8`.
fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

// === impl Params ===

impl Params {
    fn from_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Self {
        let query = uri.query().map(|q| decode(q.as_bytes())).unwrap_or_default();
        let form = (*method == Method::POST && is_form(headers)).then(|| decode(body));
        Self { query, form }
    }

    fn queries(&self) -> impl Iterator<Item = &str> {
        self.query
            .iter()
            .chain(self.form.iter().flatten())
            .filter(|(k, _)| QUERY_PARAMS.contains(&k.as_str()))
            .map(|(_, v)| v.as_str())
    }

    fn rewrite(
        &mut self,
        mut f: impl FnMut(&str) -> Result<String, rewrite::Error>,
    ) -> Result<(), rewrite::Error> {
        for (key, value) in self.query.iter_mut().chain(self.form.iter_mut().flatten()) {
            if QUERY_PARAMS.contains(&key.as_str()) {
                *value = f(value)?;
            }
        }
        Ok(())
    }
}

// === impl Upstream ===

impl Upstream {
    pub fn from_url(url: &str) -> Result<Self> {
        let uri = url
            .parse::<Uri>()
            .with_context(|| format!("invalid upstream URL: {url}"))?;
        let parts = uri.into_parts();
        let scheme = parts
            .scheme
            .ok_or_else(|| anyhow!("upstream URL must include a scheme: {url}"))?;
        let authority = parts
            .authority
            .ok_or_else(|| anyhow!("upstream URL must include a host: {url}"))?;
        let base_path = parts
            .path_and_query
            .map(|pq| pq.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        Ok(Self {
            scheme,
            authority,
            base_path,
        })
    }

    pub fn base(&self) -> Result<Uri, http::Error> {
        self.uri("/", None)
    }

    fn uri(&self, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
        let mut path_and_query = format!("{}{}", self.base_path, path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }

    /// Builds the upstream request. GET requests on query endpoints become form POSTs.
    fn request(
        &self,
        method: Method,
        path: &str,
        mut headers: HeaderMap,
        params: Params,
        body: Bytes,
    ) -> Result<Request<Body>> {
        for name in &UNFORWARDED {
            headers.remove(name);
        }
        headers.remove(header::CONTENT_LENGTH);

        let (method, query, body) = if method == Method::GET && QUERY_PATHS.contains(&path) {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
            (Method::POST, None, Bytes::from(encode(&params.query)))
        } else {
            let body = match &params.form {
                Some(form) => Bytes::from(encode(form)),
                None => body,
            };
            (method, Some(encode(&params.query)), body)
        };

        let mut req = Request::builder()
            .method(method)
            .uri(self.uri(path, query.as_deref())?)
            .body(Body::new(body))?;
        *req.headers_mut() = headers;
        Ok(req)
    }
}
