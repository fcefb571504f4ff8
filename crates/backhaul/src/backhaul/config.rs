use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::backhaul::{net, tunnel::protocol};

pub const CONFIG_ENV: &str = "BACKHAUL_CONFIG";

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

/// Precedence: `--config`, then `BACKHAUL_CONFIG`, then `backhaul.*` in the working
/// directory, then the OS default location.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
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

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("backhaul.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["backhaul.toml", "backhaul.yaml", "backhaul.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no backhaul.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/backhaul/backhaul.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "backhaul", "backhaul")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("backhaul.toml"))
    }
}

/// Writes the default template if nothing exists at `path`. Returns whether a file was
/// created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match config_format(path)? {
        Format::Toml => DEFAULT_CONFIG_TEMPLATE_TOML,
        Format::Yaml => DEFAULT_CONFIG_TEMPLATE_YAML,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

enum Format {
    Toml,
    Yaml,
}

fn config_format(path: &Path) -> anyhow::Result<Format> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(Format::Toml),
        "yaml" | "yml" => Ok(Format::Yaml),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_format(path)? {
        Format::Toml => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        Format::Yaml => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub broker: Option<BrokerConfig>,
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub control_addr: String,
    pub proxy_addr: String,
    pub transfer_addr: String,
    pub pending_ttl: Duration,
    pub reap_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_key_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_host: String,
    pub control_port: u16,
    pub transfer_port: u16,
    pub local_addr: String,
    pub dial_timeout: Duration,
}

impl AgentConfig {
    pub fn control_addr(&self) -> String {
        net::join_host_port(&self.server_host, self.control_port)
    }

    pub fn transfer_addr(&self) -> String {
        net::join_host_port(&self.server_host, self.transfer_port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    broker: Option<FileBroker>,
    agent: Option<FileAgent>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBroker {
    control_addr: Option<String>,
    proxy_addr: Option<String>,
    transfer_addr: Option<String>,
    pending_ttl_ms: Option<i64>,
    reap_interval_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    max_key_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    server_host: Option<String>,
    control_port: Option<u16>,
    transfer_port: Option<u16>,
    local_addr: Option<String>,
    dial_timeout_ms: Option<i64>,
}

fn non_empty(v: &Option<String>, default: &str) -> String {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig::default(),
            broker: None,
            agent: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            let d = LoggingConfig::default();
            cfg.logging = LoggingConfig {
                level: non_empty(&l.level, &d.level),
                format: non_empty(&l.format, &d.format),
                output: non_empty(&l.output, &d.output),
                add_source: l.add_source,
            };
        }

        // --- Broker ---
        if let Some(b) = &fc.broker {
            let max_key_bytes = b
                .max_key_bytes
                .unwrap_or(protocol::DEFAULT_MAX_KEY_BYTES as i64);
            if max_key_bytes <= 0 {
                anyhow::bail!("config: broker.max_key_bytes must be positive");
            }

            let broker = BrokerConfig {
                control_addr: non_empty(&b.control_addr, ":8082"),
                proxy_addr: non_empty(&b.proxy_addr, ":8081"),
                transfer_addr: non_empty(&b.transfer_addr, ":8083"),
                pending_ttl: millis(b.pending_ttl_ms, 30_000),
                reap_interval: millis(b.reap_interval_ms, 5_000),
                handshake_timeout: millis(b.handshake_timeout_ms, 10_000),
                max_key_bytes: max_key_bytes as usize,
            };

            let addrs = [&broker.control_addr, &broker.proxy_addr, &broker.transfer_addr];
            for (i, a) in addrs.iter().enumerate() {
                if addrs[..i].contains(a) {
                    anyhow::bail!("config: broker listeners must use distinct addresses ({a})");
                }
            }
            if broker.pending_ttl > Duration::ZERO && broker.reap_interval == Duration::ZERO {
                anyhow::bail!("config: broker.reap_interval_ms must be positive when pending_ttl_ms is set");
            }

            cfg.broker = Some(broker);
        }

        // --- Agent ---
        if let Some(a) = &fc.agent {
            let agent = AgentConfig {
                server_host: non_empty(&a.server_host, "localhost"),
                control_port: a.control_port.unwrap_or(8082),
                transfer_port: a.transfer_port.unwrap_or(8083),
                local_addr: non_empty(&a.local_addr, "localhost:9091"),
                dial_timeout: millis(a.dial_timeout_ms, 5_000),
            };
            if agent.control_port == 0 || agent.transfer_port == 0 {
                anyhow::bail!("config: agent.control_port and agent.transfer_port must be non-zero");
            }
            cfg.agent = Some(agent);
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Backhaul configuration (auto-generated)
#
# This file was created because no configuration file was found at the
# resolved config path. It runs the public-facing broker with the default
# ports. On the machine behind the NAT, replace [broker] with an [agent]
# section pointing at this host.

admin_addr = ""

[broker]
control_addr = ":8082"
proxy_addr = ":8081"
transfer_addr = ":8083"
pending_ttl_ms = 30000
reap_interval_ms = 5000
handshake_timeout_ms = 10000

# [agent]
# server_host = "broker.example.com"
# control_port = 8082
# transfer_port = 8083
# local_addr = "localhost:9091"
# dial_timeout_ms = 5000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Backhaul configuration (auto-generated)
#
# This file was created because no configuration file was found at the
# resolved config path. It runs the public-facing broker with the default
# ports. On the machine behind the NAT, replace `broker` with an `agent`
# section pointing at this host.

admin_addr: ""

broker:
  control_addr: ":8082"
  proxy_addr: ":8081"
  transfer_addr: ":8083"
  pending_ttl_ms: 30000
  reap_interval_ms: 5000
  handshake_timeout_ms: 10000

# agent:
#   server_host: "broker.example.com"
#   control_port: 8082
#   transfer_port: 8083
#   local_addr: "localhost:9091"
#   dial_timeout_ms: 5000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
