use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::lanproxy::{
    pool::{DEFAULT_CAPACITY, DEFAULT_WARM},
    transport::tls::TlsOptions,
    tunnel::Timing,
};

pub const DEFAULT_PORT: u16 = 4900;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl ConfigPathSource {
    /// Paths the user named explicitly must exist; discovered ones are optional.
    pub fn is_explicit(self) -> bool {
        matches!(self, ConfigPathSource::Flag | ConfigPathSource::Env)
    }
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("LANPROXY_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join("lanproxy.toml")));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["lanproxy.toml", "lanproxy.yaml", "lanproxy.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/lanproxy/lanproxy.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("org", "lanproxy", "lanproxy")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("lanproxy.toml"))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client_key: String,
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub pool: PoolConfig,
    pub timing: Timing,
    pub logging: LoggingConfig,
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub capacity: usize,
    pub warm: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Config {
    pub fn relay_addr(&self) -> String {
        let host = self.server.host.as_str();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.server.port)
        } else {
            format!("{host}:{}", self.server.port)
        }
    }

    /// `None` when the relay is reached over plain TCP.
    pub fn tls_options(&self) -> Option<TlsOptions> {
        self.tls.enabled.then(|| TlsOptions {
            insecure_skip_verify: self.tls.insecure_skip_verify,
            ca_file: self.tls.cert_file.clone(),
            server_name: self.tls.server_name.clone(),
        })
    }
}

/// Values taken from the command line. They win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub client_key: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub ssl: Option<bool>,
    pub cert_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    client_key: Option<String>,
    metrics_addr: Option<String>,
    server: Option<FileServer>,
    tls: Option<FileTls>,
    pool: Option<FilePool>,
    timeouts: Option<FileTimeouts>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    #[serde(default)]
    enabled: bool,
    cert_file: Option<String>,
    insecure_skip_verify: Option<bool>,
    server_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePool {
    capacity: Option<usize>,
    warm: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    heartbeat_interval_ms: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Reads the file at `path` (if any) and applies `overrides` on top.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Config> {
    let fc = match path {
        Some(p) => read_file_config(p)?,
        None => FileConfig::default(),
    };
    build(fc, overrides)
}

fn read_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn millis(key: &str, v: Option<u64>, default: Duration) -> anyhow::Result<Duration> {
    match v {
        None => Ok(default),
        Some(0) => anyhow::bail!("config: {key} must be positive"),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn build(fc: FileConfig, o: &Overrides) -> anyhow::Result<Config> {
    let server = fc.server.unwrap_or_default();
    let tls = fc.tls.unwrap_or_default();
    let pool = fc.pool.unwrap_or_default();
    let timeouts = fc.timeouts.unwrap_or_default();
    let logging = fc.logging.unwrap_or_default();

    let Some(client_key) = non_empty(o.client_key.clone()).or(non_empty(fc.client_key)) else {
        anyhow::bail!("config: client_key is required");
    };
    let Some(host) = non_empty(o.server_host.clone()).or(non_empty(server.host)) else {
        anyhow::bail!("config: server.host is required");
    };
    let port = o.server_port.or(server.port).unwrap_or(DEFAULT_PORT);
    if port == 0 {
        anyhow::bail!("config: server.port must be in 1..=65535");
    }

    let cert_file = o
        .cert_file
        .clone()
        .or(non_empty(tls.cert_file).map(PathBuf::from));
    // Without a trust root the relay's certificate cannot be checked at all.
    let insecure_skip_verify = tls.insecure_skip_verify.unwrap_or(cert_file.is_none());
    if !insecure_skip_verify && cert_file.is_none() {
        anyhow::bail!("config: tls.insecure_skip_verify = false requires tls.cert_file");
    }
    let tls = TlsConfig {
        enabled: o.ssl.unwrap_or(tls.enabled),
        cert_file,
        insecure_skip_verify,
        server_name: non_empty(tls.server_name),
    };

    let capacity = pool.capacity.unwrap_or(DEFAULT_CAPACITY);
    if capacity == 0 {
        anyhow::bail!("config: pool.capacity must be positive");
    }
    let pool = PoolConfig {
        capacity,
        warm: pool.warm.unwrap_or(DEFAULT_WARM).min(capacity),
    };

    let defaults = Timing::default();
    let timing = Timing {
        heartbeat_interval: millis(
            "timeouts.heartbeat_interval_ms",
            timeouts.heartbeat_interval_ms,
            defaults.heartbeat_interval,
        )?,
        reconnect_backoff: millis(
            "timeouts.reconnect_backoff_ms",
            timeouts.reconnect_backoff_ms,
            defaults.reconnect_backoff,
        )?,
        dial_timeout: millis(
            "timeouts.dial_timeout_ms",
            timeouts.dial_timeout_ms,
            defaults.dial_timeout,
        )?,
    };

    let format = non_empty(logging.format)
        .unwrap_or_else(|| "text".into())
        .to_ascii_lowercase();
    if !matches!(format.as_str(), "text" | "json") {
        anyhow::bail!("config: logging.format must be \"text\" or \"json\", got {format:?}");
    }
    let logging = LoggingConfig {
        level: non_empty(o.log_level.clone())
            .or(non_empty(logging.level))
            .unwrap_or_else(|| "info".into()),
        format,
        output: non_empty(logging.output).unwrap_or_else(|| "stderr".into()),
        add_source: logging.add_source,
    };

    let metrics_addr = non_empty(fc.metrics_addr)
        .map(|s| {
            s.parse::<SocketAddr>()
                .with_context(|| format!("config: invalid metrics_addr {s:?}"))
        })
        .transpose()?;

    Ok(Config {
        client_key,
        server: ServerConfig { host, port },
        tls,
        pool,
        timing,
        logging,
        metrics_addr,
    })
}
