use crate::{
    access::AccessResolver,
    cache::UserProjectCache,
    client,
    informer::{self, Informer, KubeStore},
    k8s::{watcher, ConfigMap, ManagedCluster},
    legacy::OpenShiftApi,
    metrics::RequestMetrics,
    proxy::{Proxy, Upstream},
    review::{HttpAccessReviewer, NoAccessReviewer},
    server::{self, Router},
    transport::{self, ConfigSource, HttpsConnector, ReloadMetrics, TlsPaths, TlsVersion, Transport},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use rbac_query_proxy_core::AccessReviewer;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[clap(
    name = "rbac-query-proxy",
    about = "Enforces per-cluster and per-namespace access on metrics queries"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "rbac_query_proxy=info,warn",
        env = "RBAC_QUERY_PROXY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:3002")]
    listen_addr: SocketAddr,

    /// The metrics store URL, including the base path under which requests are forwarded.
    #[clap(long, env = "RBAC_QUERY_PROXY_UPSTREAM_URL")]
    upstream_url: String,

    #[clap(long)]
    upstream_ca_file: Option<PathBuf>,

    #[clap(long)]
    upstream_cert_file: Option<PathBuf>,

    #[clap(long)]
    upstream_key_file: Option<PathBuf>,

    /// The minimum TLS version used with the upstream and the API server.
    #[clap(long, default_value = "1.2")]
    tls_min_version: TlsVersion,

    #[clap(long, default_value = "10")]
    tls_poll_interval_secs: u64,

    #[clap(long, default_value = "300")]
    upstream_timeout_secs: u64,

    #[clap(long, default_value = "300")]
    cache_expiry_secs: u64,

    #[clap(long, default_value = "60")]
    cache_sweep_interval_secs: u64,

    #[clap(
        long,
        default_value = "open-cluster-management-observability",
        env = "POD_NAMESPACE"
    )]
    observability_namespace: String,

    #[clap(long, default_value = "observability-managed-cluster-label-allowlist")]
    allowlist_configmap: String,

    #[clap(long, default_value = "60")]
    reconcile_interval_secs: u64,

    /// The API server that serves the user and project APIs.
    #[clap(long, default_value = "https://kubernetes.default.svc")]
    api_server_url: String,

    #[clap(
        long,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"
    )]
    api_ca_file: PathBuf,

    /// Reviews metrics access for a bearer token. When unset, access derives from projects alone.
    #[clap(long)]
    access_review_url: Option<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            listen_addr,
            upstream_url,
            upstream_ca_file,
            upstream_cert_file,
            upstream_key_file,
            tls_min_version,
            tls_poll_interval_secs,
            upstream_timeout_secs,
            cache_expiry_secs,
            cache_sweep_interval_secs,
            observability_namespace,
            allowlist_configmap,
            reconcile_interval_secs,
            api_server_url,
            api_ca_file,
            access_review_url,
        } = self;

        let upstream = Upstream::from_url(&upstream_url)?;
        let upstream_tls = match (upstream_ca_file, upstream_cert_file, upstream_key_file) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsPaths { ca, cert, key }),
            (None, None, None) => None,
            _ => bail!(
                "--upstream-ca-file, --upstream-cert-file and --upstream-key-file must be set together"
            ),
        };

        let informer = Informer::new();

        let mut prom = <Registry>::default();
        informer::metrics::register(
            prom.sub_registry_with_prefix("informer"),
            informer.clone(),
        );
        let reload_metrics = ReloadMetrics::register(prom.sub_registry_with_prefix("upstream"));
        let request_metrics = RequestMetrics::register(prom.sub_registry_with_prefix("proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let clusters = runtime.watch_all::<ManagedCluster>(watcher::Config::default());
        tokio::spawn(
            informer::index_clusters(informer.clone(), clusters)
                .instrument(info_span!("managedclusters")),
        );

        let allowlist = runtime.watch_namespaced::<ConfigMap>(
            observability_namespace.clone(),
            watcher::Config::default().fields(&format!("metadata.name={allowlist_configmap}")),
        );
        tokio::spawn(
            informer::index_allowlist(informer.clone(), allowlist)
                .instrument(info_span!("allowlist")),
        );

        let store = KubeStore::new(
            runtime.client(),
            observability_namespace,
            allowlist_configmap,
        );
        tokio::spawn(
            informer::run(
                informer.clone(),
                store,
                Duration::from_secs(reconcile_interval_secs),
            )
            .instrument(info_span!("reconcile")),
        );

        // Build the upstream and API server clients.

        let api_tls = transport::server_auth_config(&api_ca_file, tls_min_version)?;
        let api_client = client::build(HttpsConnector::new(
            ConfigSource::Fixed(api_tls.clone()),
            CONNECT_TIMEOUT,
            HANDSHAKE_TIMEOUT,
        ));

        let transport = match upstream_tls {
            Some(paths) => Some(Transport::new(
                paths,
                tls_min_version,
                Duration::from_secs(tls_poll_interval_secs),
                reload_metrics,
            )?),
            None => None,
        };
        let upstream_client = client::build(HttpsConnector::new(
            match &transport {
                Some(transport) => ConfigSource::Reloading(transport.clone()),
                None => ConfigSource::Fixed(api_tls),
            },
            CONNECT_TIMEOUT,
            HANDSHAKE_TIMEOUT,
        ));

        let reviewer: Arc<dyn AccessReviewer + Send + Sync> = match access_review_url {
            Some(url) => Arc::new(HttpAccessReviewer::new(api_client.clone(), url)),
            None => {
                info!("No access reviewer configured; access derives from projects");
                Arc::new(NoAccessReviewer::default())
            }
        };

        let cache = UserProjectCache::new(Duration::from_secs(cache_expiry_secs));
        cache.spawn_sweeper(Duration::from_secs(cache_sweep_interval_secs));

        let resolver = AccessResolver::new(
            reviewer,
            Arc::new(OpenShiftApi::new(api_client, &api_server_url)),
            Arc::new(informer),
            cache.clone(),
        );
        let proxy = Proxy::new(
            resolver,
            upstream_client,
            upstream,
            Duration::from_secs(upstream_timeout_secs),
            request_metrics,
        );

        // Serve requests until the runtime receives a shutdown signal.
        tokio::spawn(server::serve(
            listen_addr,
            Router::new(proxy),
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        let res = runtime.run().await;
        cache.stop();
        if let Some(transport) = transport {
            transport.close();
        }
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
