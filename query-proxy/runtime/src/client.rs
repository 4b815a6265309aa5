use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use http::{header, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use rbac_query_proxy_transport::HttpsConnector;
use serde::de::DeserializeOwned;

pub type Body = Full<Bytes>;

pub type HttpClient = Client<HttpsConnector, Body>;

pub fn build(connector: HttpsConnector) -> HttpClient {
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Issues a GET request with the bearer token and decodes the JSON response.
pub async fn get_json<T: DeserializeOwned>(client: &HttpClient, uri: &str, token: &str) -> Result<T> {
    let req = Request::get(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::ACCEPT, "application/json")
        .body(Body::default())?;
    let rsp = client
        .request(req)
        .await
        .with_context(|| format!("GET {uri}"))?;
    let status = rsp.status();
    let body = rsp.into_body().collect().await?.to_bytes();
    ensure!(status.is_success(), "GET {uri} returned {status}");
    serde_json::from_slice(&body).with_context(|| format!("GET {uri} returned invalid JSON"))
}
