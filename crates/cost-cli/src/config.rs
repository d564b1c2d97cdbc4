use crate::cli::Args;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunnel_protocol::{
    ServiceRef, DEFAULT_NAMESPACE, DEFAULT_READY_TIMEOUT, DEFAULT_SERVICE_NAME,
    DEFAULT_SERVICE_PORT,
};

const DEFAULT_CONFIG_PATH: &str = "~/.config/kubectl-cost/config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CliConfig {
    #[serde(default)]
    pub(crate) defaults: Option<ConfigDefaults>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigDefaults {
    pub(crate) namespace: Option<String>,
    pub(crate) service_name: Option<String>,
    pub(crate) service_port: Option<u16>,
    pub(crate) context: Option<String>,
    pub(crate) ready_timeout: Option<String>,
    pub(crate) request_timeout: Option<String>,
    pub(crate) use_proxy: Option<bool>,
}

/// Everything a command needs once flags and config file are merged.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) service: ServiceRef,
    pub(crate) context: Option<String>,
    pub(crate) kubeconfig: Option<PathBuf>,
    pub(crate) use_proxy: bool,
    pub(crate) ready_timeout: Duration,
    pub(crate) request_timeout: Option<Duration>,
}

fn validate_cli_config(config: &CliConfig) -> anyhow::Result<()> {
    let Some(defaults) = config.defaults.as_ref() else {
        return Ok(());
    };
    if let Some(namespace) = defaults.namespace.as_deref() {
        if namespace.trim().is_empty() {
            anyhow::bail!("defaults.namespace must not be empty");
        }
    }
    if let Some(name) = defaults.service_name.as_deref() {
        if name.trim().is_empty() {
            anyhow::bail!("defaults.service_name must not be empty");
        }
    }
    if defaults.service_port == Some(0) {
        anyhow::bail!("defaults.service_port must be between 1 and 65535");
    }
    if let Some(raw) = defaults.ready_timeout.as_deref() {
        parse_timeout("defaults.ready_timeout", raw)?;
    }
    if let Some(raw) = defaults.request_timeout.as_deref() {
        parse_timeout("defaults.request_timeout", raw)?;
    }
    Ok(())
}

fn parse_timeout(field: &str, raw: &str) -> anyhow::Result<Duration> {
    let timeout = humantime::parse_duration(raw.trim())
        .with_context(|| format!("{field} is not a duration: {raw}"))?;
    ensure_positive(field, timeout)
}

fn ensure_positive(field: &str, timeout: Duration) -> anyhow::Result<Duration> {
    if timeout.is_zero() {
        anyhow::bail!("{field} must be greater than zero");
    }
    Ok(timeout)
}

fn parse_cli_config(raw: &str, path: &Path) -> anyhow::Result<CliConfig> {
    let config: CliConfig = toml::from_str(raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    validate_cli_config(&config)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Reads the defaults file.
///
/// An explicitly named file must exist; the default location is skipped when
/// absent.
pub(crate) fn load_cli_config(explicit: Option<&Path>) -> anyhow::Result<CliConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = expand_tilde(DEFAULT_CONFIG_PATH);
            if !path.exists() {
                return Ok(CliConfig::default());
            }
            path
        }
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_cli_config(&raw, &path)
}

/// Flag beats config file beats built-in default.
pub(crate) fn resolve_settings(args: &Args, config: CliConfig) -> anyhow::Result<Settings> {
    let defaults = config.defaults.unwrap_or_default();

    let namespace = args
        .namespace
        .clone()
        .or(defaults.namespace)
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let service_name = args
        .service_name
        .clone()
        .or(defaults.service_name)
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let service_port = args
        .service_port
        .or(defaults.service_port)
        .unwrap_or(DEFAULT_SERVICE_PORT);
    if service_port == 0 {
        anyhow::bail!("--service-port must be between 1 and 65535");
    }

    let ready_timeout = match args.ready_timeout {
        Some(timeout) => ensure_positive("--ready-timeout", timeout)?,
        None => match defaults.ready_timeout.as_deref() {
            Some(raw) => parse_timeout("defaults.ready_timeout", raw)?,
            None => DEFAULT_READY_TIMEOUT,
        },
    };
    let request_timeout = match args.request_timeout {
        Some(timeout) => Some(ensure_positive("--request-timeout", timeout)?),
        None => defaults
            .request_timeout
            .as_deref()
            .map(|raw| parse_timeout("defaults.request_timeout", raw))
            .transpose()?,
    };

    Ok(Settings {
        service: ServiceRef::new(namespace, service_name, service_port),
        context: args.context.clone().or(defaults.context),
        kubeconfig: args.kubeconfig.as_deref().map(|path| {
            path.to_str()
                .map(expand_tilde)
                .unwrap_or_else(|| path.to_path_buf())
        }),
        use_proxy: args.use_proxy || defaults.use_proxy.unwrap_or(false),
        ready_timeout,
        request_timeout,
    })
}

fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
