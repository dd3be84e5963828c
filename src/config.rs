use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Process settings, read from `MAKERLAB_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login that acts as the built-in administrator.
    pub operator_login: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "makerlab".into(),
            operator_login: "operator".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults;
    /// set but unparsable numbers are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            port: parse_or(&lookup, "MAKERLAB_PORT", defaults.port)?,
            bind: lookup("MAKERLAB_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("MAKERLAB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("MAKERLAB_PASSWORD").unwrap_or(defaults.password),
            operator_login: lookup("MAKERLAB_OPERATOR").unwrap_or(defaults.operator_login),
            max_connections: parse_or(&lookup, "MAKERLAB_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_or(&lookup, "MAKERLAB_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            metrics_port: lookup("MAKERLAB_METRICS_PORT")
                .map(|v| parse_value("MAKERLAB_METRICS_PORT", &v))
                .transpose()?,
            tls_cert: lookup("MAKERLAB_TLS_CERT"),
            tls_key: lookup("MAKERLAB_TLS_KEY"),
        };
        if config.max_connections == 0 {
            return Err(invalid("MAKERLAB_MAX_CONNECTIONS must be at least 1"));
        }
        if config.operator_login.trim().is_empty() {
            return Err(invalid("MAKERLAB_OPERATOR must not be empty"));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn load_tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(invalid(
                    "both MAKERLAB_TLS_CERT and MAKERLAB_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| invalid("no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.to_string())
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> io::Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(&format!("{key}: cannot parse {raw:?}")))
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> io::Result<T> {
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
