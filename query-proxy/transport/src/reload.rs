use crate::{Backoff, Error, ReloadMetrics, TlsMaterial, TlsPaths, TlsVersion};
use parking_lot::RwLock;
use rustls::ClientConfig;
use std::{fs, path::PathBuf, sync::Arc, time::SystemTime};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

/// Upstream TLS credentials that follow rotations on disk.
///
/// Clones share the same credentials and poller.
#[derive(Clone, Debug)]
pub struct Transport(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    paths: TlsPaths,
    min_version: TlsVersion,
    active: RwLock<Snapshot>,
    stop: CancellationToken,
}

#[derive(Clone, Debug)]
struct Snapshot {
    material: Arc<TlsMaterial>,
    config: Arc<ClientConfig>,
}

/// The resolved target and modification time of each watched path. `None` marks a path whose
/// target could not be resolved.
type Targets = Vec<Option<(PathBuf, SystemTime)>>;

// === impl Transport ===

impl Transport {
    /// Loads the credentials and starts polling for rotations every `poll_interval`.
    ///
    /// Fails if the credentials cannot be loaded. Must be called on a Tokio runtime.
    pub fn new(
        paths: TlsPaths,
        min_version: TlsVersion,
        poll_interval: time::Duration,
        metrics: ReloadMetrics,
    ) -> Result<Self, Error> {
        Self::with_backoff(paths, min_version, poll_interval, Backoff::default(), metrics)
    }

    pub fn with_backoff(
        paths: TlsPaths,
        min_version: TlsVersion,
        poll_interval: time::Duration,
        backoff: Backoff,
        metrics: ReloadMetrics,
    ) -> Result<Self, Error> {
        let targets = resolve(&paths);
        let snapshot = Snapshot::load(&paths, min_version)?;
        tracing::info!(
            ca = %paths.ca.display(),
            cert = %paths.cert.display(),
            key = %paths.key.display(),
            %min_version,
            "Loaded upstream TLS credentials"
        );

        let inner = Arc::new(Inner {
            paths,
            min_version,
            active: RwLock::new(snapshot),
            stop: CancellationToken::new(),
        });
        tokio::spawn(
            poll(inner.clone(), targets, poll_interval, backoff, metrics)
                .instrument(info_span!("tls")),
        );
        Ok(Self(inner))
    }

    /// Returns the client configuration for a new connection.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.0.active.read().config.clone()
    }

    pub fn material(&self) -> Arc<TlsMaterial> {
        self.0.active.read().material.clone()
    }

    /// Stops polling. May be called any number of times from any task.
    pub fn close(&self) {
        self.0.stop.cancel();
    }
}

// === impl Snapshot ===

impl Snapshot {
    fn load(paths: &TlsPaths, min_version: TlsVersion) -> Result<Self, Error> {
        let material = TlsMaterial::load(paths, min_version)?;
        let config = material.client_config()?;
        Ok(Self {
            material: Arc::new(material),
            config,
        })
    }
}

async fn poll(
    inner: Arc<Inner>,
    mut loaded: Targets,
    poll_interval: time::Duration,
    backoff: Backoff,
    metrics: ReloadMetrics,
) {
    let mut interval = time::interval(poll_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => {
                tracing::debug!("Stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        let targets = resolve(&inner.paths);
        if targets == loaded && targets.iter().all(Option::is_some) {
            continue;
        }
        tracing::info!("Upstream TLS credentials changed");

        let paths = &inner.paths;
        let min_version = inner.min_version;
        let reload = backoff.retry("tls-reload", move || async move {
            Snapshot::load(paths, min_version)
        });
        let result = tokio::select! {
            _ = inner.stop.cancelled() => {
                tracing::debug!("Stopped");
                return;
            }
            result = reload => result,
        };

        match result {
            Ok(snapshot) => {
                *inner.active.write() = snapshot;
                loaded = resolve(&inner.paths);
                metrics.succeeded();
                tracing::info!("Reloaded upstream TLS credentials");
            }
            Err(error) => {
                metrics.failed();
                tracing::error!(
                    %error,
                    "Failed to reload upstream TLS credentials; keeping the previous credentials"
                );
            }
        }
    }
}

fn resolve(paths: &TlsPaths) -> Targets {
    paths
        .iter()
        .map(|path| {
            let target = fs::canonicalize(path).ok()?;
            let modified = fs::metadata(&target).and_then(|m| m.modified()).ok()?;
            Some((target, modified))
        })
        .collect()
}
