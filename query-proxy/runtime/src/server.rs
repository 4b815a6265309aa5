use crate::proxy::{Proxy, ResponseBody};
use anyhow::Result;
use bytes::Bytes;
use futures::future;
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{net::SocketAddr, task};
use tokio::{net::TcpListener, time};
use tracing::{debug_span, info, instrument, Instrument};

/// Bounds the upstream connectivity check of the readiness probe.
const READY_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Serves health probes and proxies every other request.
#[derive(Clone, Debug)]
pub struct Router {
    proxy: Proxy,
}

// === impl Router ===

impl Router {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }
}

impl tower::Service<Request<Incoming>> for Router {
    type Response = Response<ResponseBody>;
    type Error = hyper::Error;
    type Future = future::BoxFuture<'static, Result<Response<ResponseBody>, hyper::Error>>;

    fn poll_ready(&mut self, cx: &mut task::Context<'_>) -> task::Poll<Result<(), hyper::Error>> {
        tower::Service::poll_ready(&mut self.proxy, cx)
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        match req.uri().path() {
            "/healthz" => Box::pin(future::ok(text(StatusCode::OK, "ok".to_string()))),
            "/readyz" => {
                let proxy = self.proxy.clone();
                Box::pin(async move {
                    Ok(match proxy.ready(READY_TIMEOUT).await {
                        Ok(()) => text(StatusCode::OK, "ok".to_string()),
                        Err(error) => {
                            tracing::debug!(error = %format_args!("{error:#}"), "Not ready");
                            text(StatusCode::SERVICE_UNAVAILABLE, format!("{error:#}"))
                        }
                    })
                })
            }
            _ => tower::Service::call(&mut self.proxy, req),
        }
    }
}

fn text(status: StatusCode, body: String) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("probe response must be valid")
}

/// Accepts connections on `addr` until `drain` is signaled, then lets in-flight connections finish.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve(addr: SocketAddr, router: Router, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "proxy server listening");
    accept(listener, router, drain).await;
    Ok(())
}

async fn accept(listener: TcpListener, router: Router, drain: drain::Watch) {
    let builder = auto::Builder::new(TokioExecutor::new());

    let signaled = drain.clone().signaled();
    tokio::pin!(signaled);
    loop {
        let (socket, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    tracing::warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut signaled => {
                info!("Stopped accepting connections");
                return;
            }
        };
        if let Err(error) = socket.set_nodelay(true) {
            tracing::debug!(%error, "Failed to set TCP_NODELAY");
        }

        let builder = builder.clone();
        let svc = TowerToHyperService::new(router.clone());
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let conn = builder.serve_connection(TokioIo::new(socket), svc);
                tokio::pin!(conn);
                tokio::select! {
                    res = conn.as_mut() => {
                        if let Err(error) = res {
                            tracing::debug!(%error, "Connection closed");
                        }
                    }
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        if let Err(error) = handle.release_after(conn).await {
                            tracing::debug!(%error, "Connection closed");
                        }
                    }
                }
            }
            .instrument(debug_span!("conn", %peer)),
        );
    }
}
