use crate::cli::Cli;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::info;

static DEFAULT_PORT: u16 = 443;
static DEFAULT_TLS_CERT_PATH: &str = "/etc/admission-controller/tls/cert.pem";
static DEFAULT_TLS_KEY_PATH: &str = "/etc/admission-controller/tls/key.pem";
static DEFAULT_NOTIFIER_TIMEOUT_SECONDS: u64 = 5;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from(DEFAULT_TLS_CERT_PATH),
            key_path: PathBuf::from(DEFAULT_TLS_KEY_PATH),
        }
    }
}

/// Image policy, loaded once at startup and shared read-only by every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default, deserialize_with = "deserialize_entries")]
    pub whitelisted_namespaces: BTreeSet<String>,
    /// Empty means images may come from any registry.
    #[serde(default, deserialize_with = "deserialize_entries")]
    pub whitelisted_registries: BTreeSet<String>,
}

impl PolicyConfig {
    pub fn new<N, R>(namespaces: N, registries: R) -> Self
    where
        N: IntoIterator,
        N::Item: AsRef<str>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        Self {
            whitelisted_namespaces: normalize_entries(namespaces),
            whitelisted_registries: normalize_entries(registries),
        }
    }

    pub fn restricts_registries(&self) -> bool {
        !self.whitelisted_registries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    #[serde(default)]
    pub url: Option<SecretString>,
    #[serde(default = "default_notifier_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: DEFAULT_NOTIFIER_TIMEOUT_SECONDS,
            ca_certificate_paths: Vec::new(),
        }
    }
}

impl NotifierConfig {
    /// The configured webhook URL, `None` when notifications are disabled.
    pub fn webhook_url(&self) -> Option<&SecretString> {
        self.url.as_ref().filter(|url| !url.is_blank())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_notifier_timeout_seconds() -> u64 {
    DEFAULT_NOTIFIER_TIMEOUT_SECONDS
}

fn deserialize_entries<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<String>::deserialize(deserializer)?;
    Ok(normalize_entries(entries))
}

/// Trims entries and drops empty ones, so an unset list never matches anything.
fn normalize_entries<I>(entries: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    entries
        .into_iter()
        .map(|entry| entry.as_ref().trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Splits a comma-separated list such as `kube-system,monitoring`.
pub fn parse_list(value: &str) -> BTreeSet<String> {
    normalize_entries(value.split(','))
}

/// Builds the configuration from the optional config file, then applies command line
/// and environment overrides on top of it.
pub fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            info!("No config file given, using command line and environment settings");
            Config::default()
        }
    };

    if let Some(port) = cli.port {
        config.webserver.port = port;
    }
    if let Some(cert_path) = &cli.tls_cert {
        config.tls.cert_path = cert_path.clone();
    }
    if let Some(key_path) = &cli.tls_key {
        config.tls.key_path = key_path.clone();
    }
    if let Some(namespaces) = &cli.namespace_whitelist {
        config.policy.whitelisted_namespaces = parse_list(namespaces);
    }
    if let Some(registries) = &cli.registry_whitelist {
        config.policy.whitelisted_registries = parse_list(registries);
    }
    if let Some(url) = &cli.notifier_url {
        config.notifier.url = Some(SecretString::new(url.clone()));
    }
    if let Some(timeout_seconds) = cli.notifier_timeout_seconds {
        config.notifier.timeout_seconds = timeout_seconds;
    }
    if config.notifier.timeout_seconds == 0 {
        anyhow::bail!("Notifier timeout must be at least 1 second");
    }

    Ok(config)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut result = String::with_capacity(input.len());
    let mut last_end = 0;
    for caps in re.captures_iter(input) {
        let (Some(placeholder), Some(var_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = env::var(var_name.as_str())
            .with_context(|| format!("Missing environment variable: {}", var_name.as_str()))?;
        result.push_str(&input[last_end..placeholder.start()]);
        result.push_str(&value);
        last_end = placeholder.end();
    }
    result.push_str(&input[last_end..]);

    Ok(result)
}
