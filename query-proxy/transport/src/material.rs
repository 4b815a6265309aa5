use crate::Error;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore, SupportedProtocolVersion,
};
use std::{
    fmt, fs,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

/// Locations of the PEM files that make up the upstream client credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    /// The CA bundle used to verify the upstream server.
    pub ca: PathBuf,

    /// The client certificate chain presented to the upstream server.
    pub cert: PathBuf,

    /// The client certificate's private key.
    pub key: PathBuf,
}

/// The minimum TLS protocol version negotiated with upstream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

/// A snapshot of the credentials loaded from a [`TlsPaths`]. Never mutated after loading.
pub struct TlsMaterial {
    pub ca: Vec<CertificateDer<'static>>,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub min_version: TlsVersion,
}

// === impl TlsPaths ===

impl TlsPaths {
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [self.ca.as_path(), self.cert.as_path(), self.key.as_path()].into_iter()
    }
}

// === impl TlsVersion ===

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            Self::Tls12 => TLS12,
            Self::Tls13 => TLS13,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.2" | "VersionTLS12" => Ok(Self::Tls12),
            "1.3" | "VersionTLS13" => Ok(Self::Tls13),
            s => Err(Error::UnsupportedVersion(s.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => f.write_str("1.2"),
            Self::Tls13 => f.write_str("1.3"),
        }
    }
}

// === impl TlsMaterial ===

impl TlsMaterial {
    /// Reads and parses all three files. Fails if any file is missing, unreadable, or holds no
    /// usable PEM blocks.
    pub fn load(paths: &TlsPaths, min_version: TlsVersion) -> Result<Self, Error> {
        let ca = read_certs(&paths.ca)?;
        let cert_chain = read_certs(&paths.cert)?;
        let key = read_key(&paths.key)?;
        Ok(Self {
            ca,
            cert_chain,
            key,
            min_version,
        })
    }

    /// Builds a client configuration that verifies the server against the CA bundle and presents
    /// the client certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        let config = builder(self.min_version)?
            .with_root_certificates(roots(&self.ca)?)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &self.ca.len())
            .field("cert_chain", &self.cert_chain.len())
            .field("min_version", &self.min_version)
            .finish_non_exhaustive()
    }
}

/// Builds a client configuration that only verifies servers against the CA bundle at `ca`.
pub fn server_auth_config(ca: &Path, min_version: TlsVersion) -> Result<Arc<ClientConfig>, Error> {
    let config = builder(min_version)?
        .with_root_certificates(roots(&read_certs(ca)?)?)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn builder(
    min_version: TlsVersion,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>, Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(min_version.protocol_versions())?)
}

fn roots(ca: &[CertificateDer<'static>]) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in ca {
        roots.add(cert.clone())?;
    }
    Ok(roots)
}

fn open(path: &Path) -> Result<BufReader<fs::File>, Error> {
    fs::File::open(path)
        .map(BufReader::new)
        .map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(Error::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| Error::NoPrivateKey(path.to_path_buf()))
}
